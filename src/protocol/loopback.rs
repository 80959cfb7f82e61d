//! In-process plumbing between two protocol stacks.
//!
//! [`Loopback`] wires a's transmit side to b's decode and vice versa, for
//! tests and same-process bridging. [`FifoLoopback`] does the same through
//! a pair of bounded [`MessageFifo`]s, which may cross a thread or signal
//! boundary.

use crate::fifo::MessageFifo;
use crate::protocol::ProtocolStack;

/// Bidirectional loopback owning both stacks.
pub struct Loopback {
    pub a: ProtocolStack,
    pub b: ProtocolStack,
}

impl Loopback {
    pub fn new(a: ProtocolStack, b: ProtocolStack) -> Self {
        Loopback { a, b }
    }

    /// Shuttle transmitted frames between the stacks until both are
    /// quiescent. Returns the frames that popped out of a's and b's tops.
    pub fn pump(&mut self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let mut to_a = Vec::new();
        let mut to_b = Vec::new();
        loop {
            let tx_a = self.a.take_tx();
            let tx_b = self.b.take_tx();
            if tx_a.is_empty() && tx_b.is_empty() {
                return (to_a, to_b);
            }
            for frame in tx_a {
                to_b.extend(self.b.decode(&frame));
            }
            for frame in tx_b {
                to_a.extend(self.a.decode(&frame));
            }
        }
    }
}

/// Loopback through bounded SPSC message queues. Frames that do not fit
/// are dropped and counted.
pub struct FifoLoopback<const CAP: usize, const MSGS: usize> {
    pub a: ProtocolStack,
    pub b: ProtocolStack,
    a2b: MessageFifo<CAP, MSGS>,
    b2a: MessageFifo<CAP, MSGS>,
    dropped: usize,
}

impl<const CAP: usize, const MSGS: usize> FifoLoopback<CAP, MSGS> {
    pub fn new(a: ProtocolStack, b: ProtocolStack) -> Self {
        FifoLoopback {
            a,
            b,
            a2b: MessageFifo::new(),
            b2a: MessageFifo::new(),
            dropped: 0,
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Move transmitted frames into the queues and drain the queues into
    /// the peers, until nothing moves.
    pub fn pump(&mut self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let mut to_a = Vec::new();
        let mut to_b = Vec::new();
        loop {
            let mut moved = false;
            for frame in self.a.take_tx() {
                moved = true;
                if !self.a2b.push(&frame) {
                    self.dropped += 1;
                }
            }
            for frame in self.b.take_tx() {
                moved = true;
                if !self.b2a.push(&frame) {
                    self.dropped += 1;
                }
            }
            while let Some(frame) = self.a2b.pop() {
                moved = true;
                to_b.extend(self.b.decode(&frame));
            }
            while let Some(frame) = self.b2a.pop() {
                moved = true;
                to_a.extend(self.a.decode(&frame));
            }
            if !moved {
                return (to_a, to_b);
            }
        }
    }
}
