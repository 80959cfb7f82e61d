//! Encode-side accumulation and diagnostic layers.

use super::{Layer, LayerIo};

/// Accumulates partial encodes until `size` bytes are queued or the frame
/// ends, then forwards in one piece. Decode passes through.
pub struct BufferLayer {
    size: usize,
    buffer: Vec<u8>,
}

impl BufferLayer {
    /// `size` 0 means unbounded.
    pub fn new(size: usize) -> Self {
        BufferLayer {
            size: if size == 0 { usize::MAX } else { size },
            buffer: Vec::new(),
        }
    }
}

impl Layer for BufferLayer {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo) {
        io.up(std::mem::take(buf));
    }

    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo) {
        let mut rest = buf;
        let mut remaining = self.size - self.buffer.len();

        while remaining < rest.len() {
            // Does not fit; forward a full buffer immediately.
            if self.buffer.is_empty() {
                io.down(&rest[..remaining], false);
            } else {
                self.buffer.extend_from_slice(&rest[..remaining]);
                io.down(&self.buffer, false);
                self.buffer.clear();
            }
            rest = &rest[remaining..];
            remaining = self.size;
        }

        if last || rest.len() == remaining {
            if self.buffer.is_empty() {
                io.down(rest, last);
            } else {
                self.buffer.extend_from_slice(rest);
                io.down(&self.buffer, last);
                self.buffer.clear();
            }
        } else {
            self.buffer.extend_from_slice(rest);
        }
    }

    fn flush(&mut self, io: &mut LayerIo) -> bool {
        if !self.buffer.is_empty() {
            io.down(&self.buffer, false);
            self.buffer.clear();
        }
        true
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Pass-through layer counting traffic in both directions, so link
/// liveness can surface as a poller event (via a callback pollable holding
/// the shared activity counter).
#[derive(Default)]
pub struct IdleLayer {
    activity: std::rc::Rc<std::cell::Cell<u64>>,
}

impl IdleLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter, bumped once per decoded or encoded chunk.
    pub fn activity(&self) -> std::rc::Rc<std::cell::Cell<u64>> {
        self.activity.clone()
    }
}

impl Layer for IdleLayer {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo) {
        self.activity.set(self.activity.get() + 1);
        io.up(std::mem::take(buf));
    }

    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo) {
        self.activity.set(self.activity.get() + 1);
        io.down(buf, last);
    }
}

/// Hexdumps everything passing through, via `tracing`, at debug level.
pub struct PrintLayer {
    name: &'static str,
    enabled: bool,
}

impl PrintLayer {
    pub fn new(name: &'static str) -> Self {
        PrintLayer {
            name,
            enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn dump(&self, dir: &str, data: &[u8], last: bool) {
        if !self.enabled {
            return;
        }
        tracing::debug!(
            name = self.name,
            dir,
            last,
            len = data.len(),
            data = %hex_dump(data),
        );
    }
}

fn hex_dump(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        s.push_str(&format!("{b:02x}"));
    }
    s
}

impl Layer for PrintLayer {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo) {
        self.dump("<", buf, true);
        io.up(std::mem::take(buf));
    }

    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo) {
        self.dump(">", buf, last);
        io.down(buf, last);
    }
}
