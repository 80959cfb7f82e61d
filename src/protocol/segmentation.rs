//! Segmentation of frames into MTU-sized chunks.
//!
//! Every chunk ends in a marker byte: `C` when the frame continues in the
//! next chunk, `E` on the final chunk. Reassembly concatenates until `E`.

use super::{Layer, LayerIo};

pub const END_MARKER: u8 = b'E';
pub const CONTINUE_MARKER: u8 = b'C';

#[derive(Default)]
pub struct SegmentationLayer {
    /// Extra MTU bound on top of whatever is below; 0 uses only the lower
    /// bound.
    mtu: usize,
    reassembly: Vec<u8>,
    encoded: usize,
}

impl SegmentationLayer {
    pub fn new(mtu: usize) -> Self {
        SegmentationLayer {
            mtu,
            ..Default::default()
        }
    }

    fn chunk_mtu(&self, below: usize) -> usize {
        let m = match (self.mtu, below) {
            (0, b) => b,
            (m, 0) => m,
            (m, b) => m.min(b),
        };
        match m {
            0 => usize::MAX,
            1 => 2,
            m => m,
        }
    }
}

impl Layer for SegmentationLayer {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo) {
        if buf.is_empty() {
            return;
        }
        let last = buf[buf.len() - 1];
        if self.reassembly.is_empty() && last == END_MARKER {
            buf.pop();
            io.up(std::mem::take(buf));
            return;
        }
        self.reassembly.extend_from_slice(&buf[..buf.len() - 1]);
        if last == END_MARKER {
            io.up(std::mem::take(&mut self.reassembly));
        }
    }

    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo) {
        let mtu = self.chunk_mtu(io.below_mtu());
        let mut rest = buf;
        while !rest.is_empty() {
            let remaining = mtu - self.encoded - 1;
            let chunk = rest.len().min(remaining);
            if chunk > 0 {
                io.down(&rest[..chunk], false);
                rest = &rest[chunk..];
            }
            if chunk == remaining && !rest.is_empty() {
                io.down(&[CONTINUE_MARKER], true);
                self.encoded = 0;
            } else {
                self.encoded += chunk;
            }
        }
        if last {
            io.down(&[END_MARKER], true);
            self.encoded = 0;
        }
    }

    fn mtu(&self, _below: usize) -> usize {
        // Everything above may use any frame size.
        0
    }

    fn reset(&mut self) {
        self.reassembly.clear();
        self.encoded = 0;
    }
}
