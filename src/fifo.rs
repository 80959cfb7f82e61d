//! Bounded single-producer / single-consumer byte queues.
//!
//! Safe for use between one producer and one consumer thread, and from a
//! signal handler on either side: progress is communicated only through
//! release stores and acquire loads, there is no interior locking, and the
//! queues themselves never allocate.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// SPSC byte ring of fixed capacity `N`.
///
/// One slot is sacrificed to distinguish full from empty, so at most
/// `N - 1` bytes are in flight.
pub struct Fifo<const N: usize> {
    buf: [AtomicU8; N],
    head: AtomicUsize, // next write
    tail: AtomicUsize, // next read
}

impl<const N: usize> Default for Fifo<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Fifo<N> {
    pub fn new() -> Self {
        Fifo {
            buf: [const { AtomicU8::new(0) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        N - 1
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + N - tail) % N
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Producer side: append `data`, all or nothing. Returns `false` when
    /// it does not fit.
    pub fn push(&self, data: &[u8]) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let space = (tail + N - head - 1) % N;
        if data.len() > space {
            return false;
        }
        for (i, &b) in data.iter().enumerate() {
            self.buf[(head + i) % N].store(b, Ordering::Relaxed);
        }
        self.head.store((head + data.len()) % N, Ordering::Release);
        true
    }

    /// Consumer side: move up to `out.len()` bytes into `out`, returning
    /// how many were moved.
    pub fn pop(&self, out: &mut [u8]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let available = (head + N - tail) % N;
        let n = available.min(out.len());
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            *slot = self.buf[(tail + i) % N].load(Ordering::Relaxed);
        }
        self.tail.store((tail + n) % N, Ordering::Release);
        n
    }
}

/// Message framing over a [`Fifo`]: byte payloads delivered whole, in
/// order, bounded both in total bytes (`CAP`) and message count (`MSGS`).
pub struct MessageFifo<const CAP: usize, const MSGS: usize> {
    data: Fifo<CAP>,
    // Message lengths travel through their own ring, so a reader never
    // observes a partially pushed message.
    lengths: [AtomicUsize; MSGS],
    len_head: AtomicUsize,
    len_tail: AtomicUsize,
}

impl<const CAP: usize, const MSGS: usize> Default for MessageFifo<CAP, MSGS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize, const MSGS: usize> MessageFifo<CAP, MSGS> {
    pub fn new() -> Self {
        MessageFifo {
            data: Fifo::new(),
            lengths: [const { AtomicUsize::new(0) }; MSGS],
            len_head: AtomicUsize::new(0),
            len_tail: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = self.len_head.load(Ordering::Acquire);
        let tail = self.len_tail.load(Ordering::Acquire);
        head == tail
    }

    /// Producer side: enqueue one message, all or nothing.
    pub fn push(&self, msg: &[u8]) -> bool {
        let head = self.len_head.load(Ordering::Relaxed);
        let tail = self.len_tail.load(Ordering::Acquire);
        if (head + 1) % MSGS == tail {
            return false;
        }
        if !self.data.push(msg) {
            return false;
        }
        self.lengths[head].store(msg.len(), Ordering::Relaxed);
        self.len_head.store((head + 1) % MSGS, Ordering::Release);
        true
    }

    /// Consumer side: dequeue the next message, if any.
    pub fn pop(&self) -> Option<Vec<u8>> {
        let tail = self.len_tail.load(Ordering::Relaxed);
        let head = self.len_head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let len = self.lengths[tail].load(Ordering::Relaxed);
        let mut msg = vec![0u8; len];
        let got = self.data.pop(&mut msg);
        debug_assert_eq!(got, len);
        self.len_tail.store((tail + 1) % MSGS, Ordering::Release);
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_fifo_wraps() {
        let f: Fifo<8> = Fifo::new();
        assert_eq!(f.capacity(), 7);
        assert!(f.push(b"abcde"));
        let mut out = [0u8; 3];
        assert_eq!(f.pop(&mut out), 3);
        assert_eq!(&out, b"abc");
        assert!(f.push(b"fghij")); // wraps around
        let mut rest = [0u8; 16];
        let n = f.pop(&mut rest);
        assert_eq!(&rest[..n], b"defghij");
    }

    #[test]
    fn byte_fifo_rejects_overflow() {
        let f: Fifo<4> = Fifo::new();
        assert!(f.push(b"abc"));
        assert!(!f.push(b"d"));
        let mut out = [0u8; 4];
        assert_eq!(f.pop(&mut out), 3);
    }

    #[test]
    fn message_fifo_frames() {
        let f: MessageFifo<64, 4> = MessageFifo::new();
        assert!(f.push(b"one"));
        assert!(f.push(b"two2"));
        assert!(f.push(b""));
        assert!(!f.push(b"overflow")); // MSGS ring full (3 of 4-1... one spare)
        assert_eq!(f.pop().as_deref(), Some(&b"one"[..]));
        assert_eq!(f.pop().as_deref(), Some(&b"two2"[..]));
        assert_eq!(f.pop().as_deref(), Some(&b""[..]));
        assert_eq!(f.pop(), None);
    }

    #[test]
    fn message_fifo_cross_thread() {
        use std::sync::Arc;
        let f: Arc<MessageFifo<1024, 16>> = Arc::new(MessageFifo::new());
        let producer = {
            let f = Arc::clone(&f);
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    let msg = i.to_le_bytes();
                    while !f.push(&msg) {
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut seen = 0u32;
        while seen < 100 {
            if let Some(msg) = f.pop() {
                assert_eq!(u32::from_le_bytes(msg.try_into().unwrap()), seen);
                seen += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
