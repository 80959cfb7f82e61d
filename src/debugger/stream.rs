//! Debugger stream buffers.
//!
//! A stream is an append-only byte buffer drained by the `s` command.
//! Optionally, a stateful zlib compressor sits in front of the buffer; a
//! flush finishes the current compressed stream (making its tail readable)
//! and restarts the compressor, so each flushed segment decompresses
//! independently.

use flate2::{Compress, Compression, FlushCompress, Status};

pub struct Stream {
    buf: Vec<u8>,
    blocked: bool,
    compress: Option<Compress>,
    /// Raw bytes fed to the compressor since its last finish.
    pending: usize,
    soft_cap: usize,
    overflow: usize,
}

impl Stream {
    pub fn new(soft_cap: usize, overflow: usize, compressed: bool) -> Self {
        Stream {
            buf: Vec::new(),
            blocked: false,
            compress: compressed.then(|| Compress::new(Compression::default(), true)),
            pending: 0,
            soft_cap,
            overflow,
        }
    }

    pub fn compressed(&self) -> bool {
        self.compress.is_some()
    }

    /// Append data; dropped while the stream is blocked.
    pub fn encode(&mut self, data: &[u8]) {
        if self.blocked || data.is_empty() {
            return;
        }
        match &mut self.compress {
            None => self.buf.extend_from_slice(data),
            Some(c) => {
                self.pending += data.len();
                run_compress(c, data, &mut self.buf, FlushCompress::None);
            }
        }
    }

    /// How many of `n` bytes still fit under the hard cap (soft cap plus
    /// overflow margin). Nothing fits while the stream is blocked.
    pub fn fits(&self, n: usize) -> usize {
        if self.blocked {
            return 0;
        }
        let hard = self.soft_cap + self.overflow;
        n.min(hard.saturating_sub(self.buf.len()))
    }

    /// Finish the compressor so its tail becomes readable, and block the
    /// stream until it is drained.
    pub fn flush(&mut self) {
        if let Some(c) = &mut self.compress {
            if self.pending > 0 {
                run_compress(c, &[], &mut self.buf, FlushCompress::Finish);
                c.reset();
                self.pending = 0;
            }
        }
        self.blocked = true;
    }

    /// Read-once retrieval: returns the buffered bytes and unblocks.
    pub fn drain(&mut self) -> Vec<u8> {
        self.blocked = false;
        std::mem::take(&mut self.buf)
    }

    /// Drop the first `n` buffered bytes, after they were emitted on the
    /// wire elsewhere.
    pub fn drop_front(&mut self, n: usize) {
        self.buf.drain(..n.min(self.buf.len()));
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn empty(&self) -> bool {
        self.buf.is_empty() && self.pending == 0
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pending = 0;
        if let Some(c) = &mut self.compress {
            c.reset();
        }
        self.blocked = false;
    }

    pub fn block(&mut self) {
        self.blocked = true;
    }

    pub fn unblock(&mut self) {
        self.blocked = false;
    }

    pub fn blocked(&self) -> bool {
        self.blocked
    }
}

fn run_compress(c: &mut Compress, mut input: &[u8], out: &mut Vec<u8>, flush: FlushCompress) {
    loop {
        let before_in = c.total_in();
        out.reserve((input.len() / 2).max(64));
        let status = match c.compress_vec(input, out, flush) {
            Ok(s) => s,
            Err(_) => return,
        };
        let consumed = (c.total_in() - before_in) as usize;
        input = &input[consumed..];
        match (status, flush) {
            (Status::StreamEnd, _) => return,
            (_, FlushCompress::None) if input.is_empty() => return,
            (Status::BufError, _) => continue,
            _ => {}
        }
    }
}
