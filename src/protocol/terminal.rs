//! Debug-message extraction from a terminal byte stream.
//!
//! Debug frames travel between APC (`ESC _`) and ST (`ESC \`) brackets;
//! everything else is application terminal data, handed to a callback.

use super::{Layer, LayerIo};
use crate::protocol::ascii::ESC;

pub const ESC_START: u8 = b'_'; // APC
pub const ESC_END: u8 = b'\\'; // ST

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd)]
enum DecodeState {
    Normal,
    NormalEsc,
    Debug,
    DebugEsc,
}

pub type NonDebugCallback = Box<dyn FnMut(&[u8])>;

pub struct TerminalLayer {
    non_debug: Option<NonDebugCallback>,
    state: DecodeState,
    buffer: Vec<u8>,
    in_frame: bool,
}

impl TerminalLayer {
    pub fn new(non_debug: Option<NonDebugCallback>) -> Self {
        TerminalLayer {
            non_debug,
            state: DecodeState::Normal,
            buffer: Vec::new(),
            in_frame: false,
        }
    }

    fn non_debug_decode(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(cb) = &mut self.non_debug {
            cb(data);
        }
    }
}

impl Layer for TerminalLayer {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo) {
        let data = std::mem::take(buf);
        let mut non_debug_from = if self.state < DecodeState::Debug {
            Some(0usize)
        } else {
            None
        };

        for (i, &c) in data.iter().enumerate() {
            match self.state {
                DecodeState::Normal => {
                    if c == ESC {
                        self.state = DecodeState::NormalEsc;
                    }
                }
                DecodeState::NormalEsc => {
                    if c == ESC_START {
                        if let Some(from) = non_debug_from {
                            if i > from + 1 {
                                // Exclude the ESC that started the bracket.
                                let chunk = data[from..i - 1].to_vec();
                                self.non_debug_decode(&chunk);
                            }
                        }
                        self.state = DecodeState::Debug;
                        non_debug_from = None;
                    } else {
                        self.state = DecodeState::Normal;
                    }
                }
                DecodeState::Debug => {
                    if c == ESC {
                        self.state = DecodeState::DebugEsc;
                    } else {
                        self.buffer.push(c);
                    }
                }
                DecodeState::DebugEsc => {
                    if c == ESC_END {
                        io.up(std::mem::take(&mut self.buffer));
                        self.state = DecodeState::Normal;
                        non_debug_from = Some(i + 1);
                    } else {
                        self.state = DecodeState::Debug;
                        self.buffer.push(ESC);
                        self.buffer.push(c);
                    }
                }
            }
        }

        if let Some(from) = non_debug_from {
            if from < data.len() {
                let chunk = data[from..].to_vec();
                self.non_debug_decode(&chunk);
            }
        }
    }

    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo) {
        if !self.in_frame {
            self.in_frame = true;
            io.down(&[ESC, ESC_START], false);
        }
        io.down(buf, false);
        if last {
            self.in_frame = false;
            io.down(&[ESC, ESC_END], true);
        }
    }

    fn mtu(&self, below: usize) -> usize {
        match below {
            0 => 0,
            1..=4 => 1,
            m => m - 4,
        }
    }

    fn reset(&mut self) {
        self.state = DecodeState::Normal;
        self.in_frame = false;
        self.buffer.clear();
    }
}
