//! General-purpose reliability for bidirectional streams.
//!
//! Every frame starts with a header byte: a 6-bit sequence number plus
//! [`ACK_FLAG`] and [`NOP_FLAG`]. Outbound messages stay queued until
//! acked; a header with seq 0 is a reset. A frame may carry ack headers
//! followed by at most one data message.

use super::{Layer, LayerIo};

pub const SEQ_MASK: u8 = 0x3f;
pub const ACK_FLAG: u8 = 0x80;
pub const NOP_FLAG: u8 = 0x40;

/// Consecutive retransmits of one message before [`ArqEvent::Retransmit`]
/// fires.
pub const RETRANSMIT_CALLBACK_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqEvent {
    /// The peer acked our reset; the connection is established.
    Connected,
    /// The peer reset; outstanding messages were renumbered and will be
    /// replayed.
    Reconnect,
    /// The same message was retransmitted [`RETRANSMIT_CALLBACK_THRESHOLD`]
    /// times without an ack.
    Retransmit,
    /// The encode queue exceeded its limit. Return `true` from the callback
    /// to drop the offending message.
    EncodeBufferOverflow,
}

pub type ArqCallback = Box<dyn FnMut(ArqEvent) -> bool>;

#[derive(PartialEq)]
enum EncodeState {
    Idle,
    Encoding,
}

pub(crate) fn next_seq(seq: u8) -> u8 {
    let seq = (seq + 1) & SEQ_MASK;
    if seq == 0 {
        1
    } else {
        seq
    }
}

pub struct ArqLayer {
    max_encode_buffer: usize,
    callback: Option<ArqCallback>,
    encode_queue: std::collections::VecDeque<Vec<u8>>,
    encode_queue_size: usize,
    encode_state: EncodeState,
    dropping: bool,
    did_transmit: bool,
    retransmits: usize,
    send_seq: u8,
    recv_seq: u8,
}

impl ArqLayer {
    /// `max_encode_buffer` bounds the combined length of queued messages;
    /// 0 means unbounded.
    pub fn new(max_encode_buffer: usize) -> Self {
        let mut this = ArqLayer {
            max_encode_buffer,
            callback: None,
            encode_queue: std::collections::VecDeque::new(),
            encode_queue_size: 0,
            encode_state: EncodeState::Idle,
            dropping: false,
            did_transmit: false,
            retransmits: 0,
            send_seq: 0,
            recv_seq: 0,
        };
        this.queue_reset();
        this
    }

    pub fn set_callback(&mut self, cb: ArqCallback) {
        self.callback = Some(cb);
    }

    // Seq-0 nop announcing a (re)start; transmitted at the next
    // opportunity.
    fn queue_reset(&mut self) {
        self.encode_queue.push_back(vec![self.send_seq | NOP_FLAG]);
        self.encode_queue_size += 1;
        self.send_seq = next_seq(self.send_seq);
    }

    fn event(&mut self, e: ArqEvent) -> bool {
        if e == ArqEvent::Retransmit {
            tracing::debug!(retransmits = self.retransmits, "arq retransmit threshold");
        }
        match &mut self.callback {
            Some(cb) => cb(e),
            None => false,
        }
    }

    fn waiting_for_ack(&self) -> bool {
        if self.encode_queue.is_empty() {
            return false;
        }
        !(self.encode_queue.len() == 1 && self.encode_state != EncodeState::Idle)
    }

    /// (Re)transmit the head of the queue. Returns `false` when there is
    /// nothing complete to send.
    fn transmit(&mut self, io: &mut LayerIo) -> bool {
        if self.encode_queue.is_empty() {
            return false;
        }
        if self.encode_queue.len() == 1 && self.encode_state == EncodeState::Encoding {
            return false;
        }
        self.did_transmit = true;
        self.retransmits = self.retransmits.saturating_add(1);
        if self.retransmits >= RETRANSMIT_CALLBACK_THRESHOLD {
            self.event(ArqEvent::Retransmit);
        }
        let msg = self.encode_queue.front().expect("queue checked").clone();
        io.down(&msg, true);
        true
    }

    fn pop_encode_queue(&mut self) {
        if let Some(front) = self.encode_queue.pop_front() {
            self.encode_queue_size -= front.len();
        }
    }

    /// Number of consecutive retransmits of the message currently awaiting
    /// an ack; a growing value signals link degradation.
    pub fn retransmits(&self) -> usize {
        self.retransmits.saturating_sub(1)
    }

    /// Inject a nop so the remote ack confirms the link; retransmits the
    /// outstanding message when one is pending.
    pub fn keep_alive(&mut self, io: &mut LayerIo) {
        if self.encode_queue.is_empty() {
            self.encode_queue.push_back(vec![self.send_seq | NOP_FLAG]);
            self.encode_queue_size += 1;
            self.send_seq = next_seq(self.send_seq);
        }
        self.transmit(io);
    }

    /// See [`Layer::flush`]; also used to push the initial reset out of a
    /// freshly built stack.
    fn flush_impl(&mut self, io: &mut LayerIo) -> bool {
        !self.transmit(io)
    }

    pub fn did_transmit(&self) -> bool {
        self.did_transmit
    }

    pub fn reset_did_transmit(&mut self) {
        self.did_transmit = false;
    }
}

impl Layer for ArqLayer {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo) {
        let mut data: &[u8] = buf;
        let mut reconnect = false;
        let mut resp: Vec<u8> = Vec::with_capacity(2);
        let mut do_transmit = false;
        let mut do_decode = false;

        while !data.is_empty() {
            let hdr = data[0];

            if hdr & ACK_FLAG != 0 {
                if self.waiting_for_ack()
                    && hdr & SEQ_MASK == self.encode_queue.front().expect("waiting")[0] & SEQ_MASK
                {
                    // They got our last transmission.
                    self.pop_encode_queue();
                    self.retransmits = 0;
                    do_transmit = true;

                    if hdr & SEQ_MASK == 0 {
                        reconnect = true;
                        self.event(ArqEvent::Connected);
                    }
                }
                data = &data[1..];
            } else if hdr & SEQ_MASK == self.recv_seq {
                // The proper next message.
                resp.push(self.recv_seq | ACK_FLAG);
                self.recv_seq = next_seq(self.recv_seq);
                do_decode = hdr & NOP_FLAG == 0;
                do_transmit = true;
                data = &data[1..];
            } else if hdr & SEQ_MASK == 0 {
                // Unexpected reset; restart both directions.
                self.event(ArqEvent::Reconnect);
                self.recv_seq = next_seq(0);
                resp.push(ACK_FLAG);

                if !reconnect
                    && (self.encode_queue.is_empty()
                        || self.encode_queue.front().expect("nonempty")[0] != NOP_FLAG)
                {
                    // Reissue a reset of our own, then replay outstanding
                    // messages with fresh seqs.
                    self.encode_queue.push_front(vec![NOP_FLAG]);
                    self.encode_queue_size += 1;
                    let mut seq = next_seq(0);
                    for msg in self.encode_queue.iter_mut().skip(1) {
                        msg[0] = (msg[0] & !SEQ_MASK) | seq;
                        seq = next_seq(seq);
                    }
                    self.send_seq = seq;
                }

                do_transmit = true;
                data = &data[1..];
            } else if next_seq(hdr & SEQ_MASK) == self.recv_seq {
                // Retransmit of the previous message; ack again, do not
                // re-deliver.
                resp.push((hdr & SEQ_MASK) | ACK_FLAG);
                if hdr & NOP_FLAG != 0 {
                    data = &data[1..];
                } else {
                    data = &[];
                }
            } else {
                data = &[];
                do_transmit = true;
            }

            if do_decode {
                // Rest of the frame is payload.
                break;
            }
            if resp.len() == 2 {
                // Unexpected amount of responses; drop and await
                // retransmit.
                break;
            }
        }

        let payload = data.to_vec();

        if !resp.is_empty() {
            io.down(&resp, !do_transmit);
            self.did_transmit = true;
        }
        if do_transmit && !self.transmit(io) && !resp.is_empty() {
            io.down(&[], true);
        }
        if do_decode {
            io.up(payload);
        }
    }

    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo) {
        if self.dropping {
            // Remainder of a message the overflow callback discarded.
            if last {
                self.dropping = false;
            }
            return;
        }
        if self.max_encode_buffer > 0
            && self.max_encode_buffer < self.encode_queue_size + buf.len() + 1
            && self.event(ArqEvent::EncodeBufferOverflow)
        {
            // Callback chose to drop the message.
            if self.encode_state == EncodeState::Encoding {
                if let Some(partial) = self.encode_queue.pop_back() {
                    self.encode_queue_size -= partial.len();
                    self.send_seq = partial[0] & SEQ_MASK;
                }
                self.encode_state = EncodeState::Idle;
            }
            self.dropping = !last;
            return;
        }

        match self.encode_state {
            EncodeState::Idle => {
                let mut msg = Vec::with_capacity(buf.len() + 1);
                msg.push(self.send_seq);
                msg.extend_from_slice(buf);
                self.send_seq = next_seq(self.send_seq);
                self.encode_queue_size += msg.len();
                self.encode_queue.push_back(msg);
                if !last {
                    self.encode_state = EncodeState::Encoding;
                }
            }
            EncodeState::Encoding => {
                self.encode_queue_size += buf.len();
                self.encode_queue
                    .back_mut()
                    .expect("encoding in progress")
                    .extend_from_slice(buf);
                if last {
                    self.encode_state = EncodeState::Idle;
                }
            }
        }

        self.transmit(io);
    }

    fn mtu(&self, below: usize) -> usize {
        match below {
            0 => 0,
            1 | 2 => 1,
            m => m - 2,
        }
    }

    fn flush(&mut self, io: &mut LayerIo) -> bool {
        self.flush_impl(io)
    }

    fn reset(&mut self) {
        self.encode_queue.clear();
        self.encode_queue_size = 0;
        self.encode_state = EncodeState::Idle;
        self.dropping = false;
        self.did_transmit = false;
        self.retransmits = 0;
        self.send_seq = 0;
        self.recv_seq = 0;
        self.queue_reset();
    }
}
