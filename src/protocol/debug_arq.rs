//! Request/response reliability for the debugger.
//!
//! Every request carries a 7-bit-varint sequence number; the response is
//! buffered (when precious) so a retransmitted request re-emits the exact
//! same response. Purgeable responses are forwarded unbuffered and may be
//! recomputed, so their content is allowed to change on retransmit.
//! [`RESET_FLAG`] on the first seq byte restarts both directions from 1.

use super::{Layer, LayerIo};

pub const RESET_FLAG: u8 = 0x80;
const SEQ_MOD: u32 = 0x800_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    Decoding,
    Decoded,
    Retransmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodeState {
    Idle,
    Encoding,
    UnbufferedIdle,
    UnbufferedEncoding,
}

pub struct DebugArqLayer {
    decode_state: DecodeState,
    decode_seq: u32,
    decode_seq_start: u32,
    encode_state: EncodeState,
    encode_seq: u32,
    encode_seq_reset: bool,
    max_encode_buffer: usize,
    encode_buffer: Vec<Vec<u8>>,
    encode_buffer_size: usize,
}

fn next_seq(seq: u32) -> u32 {
    let seq = (seq + 1) % SEQ_MOD;
    if seq == 0 {
        1
    } else {
        seq
    }
}

/// Strip the sequence number off the front of `data`. The first byte keeps
/// 6 value bits (0x40 marks a multi-byte number); continuation bytes keep
/// 7 (0x80 marks more to come).
fn decode_seq(data: &mut &[u8]) -> u32 {
    let mut seq: u32 = 0;
    let mut flag: u8 = 0x40;
    loop {
        let Some((&b, rest)) = data.split_first() else {
            return u32::MAX;
        };
        *data = rest;
        seq = (seq << 7) | u32::from(b & (flag - 1));
        if b & flag == 0 {
            return seq;
        }
        flag = 0x80;
    }
}

fn encode_seq(seq: u32, out: &mut Vec<u8>) {
    let seq = seq % SEQ_MOD;
    if seq < 0x40 {
        out.push((seq & 0x3f) as u8);
    } else if seq < 0x2000 {
        out.push(0x40 | ((seq >> 7) & 0x3f) as u8);
        out.push((seq & 0x7f) as u8);
    } else if seq < 0x10_0000 {
        out.push(0x40 | ((seq >> 14) & 0x3f) as u8);
        out.push(0x80 | ((seq >> 7) & 0x7f) as u8);
        out.push((seq & 0x7f) as u8);
    } else {
        out.push(0x40 | ((seq >> 21) & 0x3f) as u8);
        out.push(0x80 | ((seq >> 14) & 0x7f) as u8);
        out.push(0x80 | ((seq >> 7) & 0x7f) as u8);
        out.push((seq & 0x7f) as u8);
    }
}

impl DebugArqLayer {
    /// `max_encode_buffer` caps the buffered response; overflowing it
    /// automatically downgrades the response to purgeable. 0 means
    /// unbounded.
    pub fn new(max_encode_buffer: usize) -> Self {
        DebugArqLayer {
            decode_state: DecodeState::Idle,
            decode_seq: 1,
            decode_seq_start: 0,
            encode_state: EncodeState::Idle,
            encode_seq: 1,
            encode_seq_reset: true,
            max_encode_buffer,
            encode_buffer: Vec::new(),
            encode_buffer_size: 0,
        }
    }

    fn purgeable(&self) -> bool {
        matches!(
            self.encode_state,
            EncodeState::UnbufferedIdle | EncodeState::UnbufferedEncoding
        )
    }

    fn apply_purgeable(&mut self, purgeable: bool, io: &mut LayerIo) {
        if self.purgeable() == purgeable {
            return;
        }

        if purgeable {
            match self.encode_state {
                EncodeState::Encoding => {
                    // Release what was buffered so far and stay unbuffered.
                    let s = self.encode_buffer.last().expect("encoding");
                    io.down(s, false);
                    self.encode_state = EncodeState::UnbufferedEncoding;
                }
                EncodeState::Idle => {
                    self.encode_state = EncodeState::UnbufferedIdle;
                }
                _ => {}
            }
            self.encode_buffer.clear();
            self.encode_buffer_size = 0;
        } else {
            match self.encode_state {
                // First part already on the wire; switch back to precious
                // only at the next request.
                EncodeState::UnbufferedEncoding => {}
                EncodeState::UnbufferedIdle => {
                    self.encode_state = EncodeState::Idle;
                }
                _ => {}
            }
        }
    }
}

impl Layer for DebugArqLayer {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo) {
        if buf.is_empty() {
            return;
        }

        let mut data: &[u8] = buf;
        let flags = data[0];
        let seq = decode_seq(&mut data);

        if flags & RESET_FLAG != 0 {
            self.decode_state = DecodeState::Idle;
            self.encode_state = EncodeState::Idle;
            self.encode_buffer.clear();
            self.encode_buffer_size = 0;
            self.decode_seq = next_seq(seq);
            self.encode_seq = 1;
            io.down(&[RESET_FLAG], true);
            self.encode_seq_reset = false;
        }

        match self.decode_state {
            DecodeState::Decoded => {
                if seq == self.decode_seq {
                    // The next command; the previous response was received.
                    self.decode_state = DecodeState::Idle;
                    self.encode_state = EncodeState::Idle;
                    self.encode_buffer.clear();
                    self.encode_buffer_size = 0;
                } else if seq == self.decode_seq_start {
                    self.handle_retransmit_start();
                }
            }
            DecodeState::Retransmit => {
                if seq == self.decode_seq_start {
                    self.handle_retransmit_start();
                }
            }
            _ => {}
        }

        match self.decode_state {
            DecodeState::Retransmit => {
                if next_seq(seq) == self.decode_seq {
                    // Last part of the retransmitted command; replay the
                    // buffered response.
                    for part in &self.encode_buffer {
                        io.down(part, true);
                    }
                    self.decode_state = DecodeState::Decoded;
                }
            }
            DecodeState::Idle | DecodeState::Decoding => {
                if self.decode_state == DecodeState::Idle {
                    self.decode_seq_start = self.decode_seq;
                    self.decode_state = DecodeState::Decoding;
                }
                if seq == self.decode_seq {
                    self.decode_seq = next_seq(self.decode_seq);
                    io.up(data.to_vec());
                }
            }
            DecodeState::Decoded => {}
        }
    }

    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo) {
        if self.decode_state == DecodeState::Decoding {
            // First part of the response; the request must have been
            // complete.
            self.decode_state = DecodeState::Decoded;
        }

        if matches!(
            self.encode_state,
            EncodeState::Idle | EncodeState::Encoding
        ) && self.max_encode_buffer > 0
            && self.encode_buffer_size + buf.len() > self.max_encode_buffer
        {
            self.apply_purgeable(true, io);
        }

        let mut seq = Vec::with_capacity(4);
        if matches!(
            self.encode_state,
            EncodeState::Idle | EncodeState::UnbufferedIdle
        ) {
            encode_seq(self.encode_seq, &mut seq);
            self.encode_seq = next_seq(self.encode_seq);
            if self.encode_seq_reset {
                seq[0] |= RESET_FLAG;
                self.encode_seq_reset = false;
            }
        }

        match self.encode_state {
            EncodeState::UnbufferedIdle | EncodeState::UnbufferedEncoding => {
                if self.encode_state == EncodeState::UnbufferedIdle {
                    io.down(&seq, false);
                    self.encode_state = EncodeState::UnbufferedEncoding;
                }
                io.down(buf, last);
                if last {
                    self.encode_state = EncodeState::UnbufferedIdle;
                }
            }
            EncodeState::Idle | EncodeState::Encoding => {
                if self.encode_state == EncodeState::Idle {
                    self.encode_buffer_size += seq.len();
                    self.encode_buffer.push(seq);
                    self.encode_state = EncodeState::Encoding;
                }
                self.encode_buffer_size += buf.len();
                let frame = self.encode_buffer.last_mut().expect("encoding");
                frame.extend_from_slice(buf);
                if last {
                    let frame = self.encode_buffer.last().expect("encoding").clone();
                    io.down(&frame, true);
                    self.encode_state = EncodeState::Idle;
                }
            }
        }
    }

    fn mtu(&self, below: usize) -> usize {
        match below {
            0 => 0,
            1..=4 => 1,
            m => m - 4,
        }
    }

    fn set_purgeable(&mut self, purgeable: bool, io: &mut LayerIo) -> bool {
        self.apply_purgeable(purgeable, io);
        true
    }

    fn reset(&mut self) {
        self.decode_state = DecodeState::Idle;
        self.decode_seq = 1;
        self.decode_seq_start = 0;
        self.encode_state = EncodeState::Idle;
        self.encode_seq = 1;
        self.encode_seq_reset = true;
        self.encode_buffer.clear();
        self.encode_buffer_size = 0;
    }
}

impl DebugArqLayer {
    // A retransmit of the current command was detected.
    fn handle_retransmit_start(&mut self) {
        match self.encode_state {
            EncodeState::UnbufferedIdle => {
                // The response was purgeable: re-execute the command. The
                // content may differ, so restart its seq numbering.
                self.encode_state = EncodeState::Idle;
                self.decode_seq = self.decode_seq_start;
                self.decode_state = DecodeState::Idle;
                self.encode_seq_reset = true;
            }
            EncodeState::Idle => {
                // Wait for the full retransmit, then replay the buffer.
                self.decode_state = DecodeState::Retransmit;
            }
            _ => {}
        }
    }
}
