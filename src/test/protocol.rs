use rstest::rstest;

use crate::protocol::arq::{ArqEvent, ArqLayer};
use crate::protocol::ascii::AsciiEscapeLayer;
use crate::protocol::buffer::{BufferLayer, IdleLayer};
use crate::protocol::crc::{Crc16Layer, Crc8Layer};
use crate::protocol::debug_arq::DebugArqLayer;
use crate::protocol::loopback::{FifoLoopback, Loopback};
use crate::protocol::segmentation::SegmentationLayer;
use crate::protocol::terminal::TerminalLayer;
use crate::protocol::{Layer, ProtocolStack, Responder};

fn stack_with<L: Layer + 'static>(layer: L) -> ProtocolStack {
    let mut s = ProtocolStack::new();
    s.push(layer);
    s
}

#[rstest]
#[case::ascii(stack_with(AsciiEscapeLayer::new(false)))]
#[case::ascii_all(stack_with(AsciiEscapeLayer::new(true)))]
#[case::terminal(stack_with(TerminalLayer::new(None)))]
#[case::segmentation(stack_with(SegmentationLayer::new(0)))]
#[case::segmentation_small(stack_with(SegmentationLayer::new(4)))]
#[case::crc8(stack_with(Crc8Layer::new()))]
#[case::crc16(stack_with(Crc16Layer::new()))]
#[case::buffer(stack_with(BufferLayer::new(0)))]
#[case::buffer_bounded(stack_with(BufferLayer::new(3)))]
fn layer_round_trip(#[case] mut stack: ProtocolStack) {
    for msg in [
        &b""[..],
        b"x",
        b"hello world",
        b"a slightly longer payload with EEE and CCC inside",
    ] {
        stack.encode(msg);
        let frames = stack.take_tx();
        assert!(!frames.is_empty());
        let mut delivered = Vec::new();
        for f in &frames {
            delivered.extend(stack.decode(f));
        }
        assert_eq!(delivered.concat(), msg);
        assert_eq!(delivered.len(), 1, "one frame per message");
    }
}

#[test]
fn ascii_escapes_the_conflicting_bytes() {
    let mut s = stack_with(AsciiEscapeLayer::new(false));
    s.encode(&[0x00, b'A', 0x1b, 0x11, 0x13, b'\r']);
    let tx = s.take_tx();
    assert_eq!(
        tx,
        vec![vec![
            0x1b, 0x40, // NUL
            b'A', // untouched
            0x1b, 0x1b, // ESC is its own escape
            0x1b, 0x51, // XON
            0x1b, 0x53, // XOFF
            0x1b, 0x4d, // CR
        ]]
    );

    let delivered = s.decode(&tx[0]);
    assert_eq!(delivered, vec![vec![0x00, b'A', 0x1b, 0x11, 0x13, b'\r']]);
}

#[test]
fn ascii_decode_drops_bare_carriage_returns() {
    let mut s = stack_with(AsciiEscapeLayer::new(false));
    let delivered = s.decode(b"ab\rcd");
    assert_eq!(delivered, vec![b"abcd".to_vec()]);
}

#[test]
fn terminal_brackets_frames_and_passes_terminal_data() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let mut s = stack_with(TerminalLayer::new(Some(Box::new(move |data: &[u8]| {
        seen2.borrow_mut().extend_from_slice(data);
    }))));

    s.encode(b"msg");
    assert_eq!(
        s.take_tx(),
        vec![vec![0x1b, b'_', b'm', b's', b'g', 0x1b, b'\\']]
    );

    let delivered = s.decode(b"shell$ \x1b_dbg\x1b\\ more");
    assert_eq!(delivered, vec![b"dbg".to_vec()]);
    assert_eq!(seen.borrow().as_slice(), b"shell$  more");
}

#[test]
fn terminal_reassembles_across_reads() {
    let mut s = stack_with(TerminalLayer::new(None));
    assert!(s.decode(b"\x1b").is_empty());
    assert!(s.decode(b"_ab").is_empty());
    assert!(s.decode(b"c\x1b").is_empty());
    let delivered = s.decode(b"\\");
    assert_eq!(delivered, vec![b"abc".to_vec()]);
}

#[test]
fn segmentation_splits_at_the_mtu() {
    let mut s = stack_with(SegmentationLayer::new(4));
    s.encode(b"12345");
    assert_eq!(s.take_tx(), vec![b"123C".to_vec(), b"45E".to_vec()]);

    assert!(s.decode(b"123C").is_empty());
    assert_eq!(s.decode(b"45E"), vec![b"12345".to_vec()]);
}

#[test]
fn segmentation_takes_the_lower_mtu_into_account() {
    let mut s = ProtocolStack::new();
    s.set_transport_mtu(4);
    s.push(SegmentationLayer::new(0));
    assert_eq!(s.mtu(), 0, "unbounded above the segmentation layer");
    s.encode(b"12345");
    assert_eq!(s.take_tx(), vec![b"123C".to_vec(), b"45E".to_vec()]);
}

#[test]
fn crc8_of_an_empty_frame_is_the_init_value() {
    let mut s = stack_with(Crc8Layer::new());
    s.encode(b"");
    assert_eq!(s.take_tx(), vec![vec![0xff]]);
    let mut s16 = stack_with(Crc16Layer::new());
    s16.encode(b"");
    assert_eq!(s16.take_tx(), vec![vec![0xff, 0xff]]);
}

#[test]
fn corrupted_frames_are_dropped_silently() {
    let mut s8 = stack_with(Crc8Layer::new());
    s8.encode(b"payload");
    let frame = s8.take_tx().remove(0);
    assert_eq!(frame.len(), 8);
    let mut bad = frame.clone();
    bad[1] ^= 0x20;
    assert!(s8.decode(&bad).is_empty());
    assert_eq!(s8.decode(&frame), vec![b"payload".to_vec()]);

    let mut s16 = stack_with(Crc16Layer::new());
    s16.encode(b"payload");
    let frame = s16.take_tx().remove(0);
    assert_eq!(frame.len(), 9);
    let mut bad = frame.clone();
    *bad.last_mut().unwrap() ^= 1;
    assert!(s16.decode(&bad).is_empty());
    assert_eq!(s16.decode(&frame), vec![b"payload".to_vec()]);
}

#[test]
fn buffer_layer_accumulates_partial_encodes() {
    let mut s = stack_with(BufferLayer::new(0));
    Responder::write(&mut s, b"ab", false);
    assert!(s.take_tx().is_empty());
    Responder::write(&mut s, b"cd", true);
    assert_eq!(s.take_tx(), vec![b"abcd".to_vec()]);
}

#[test]
fn mtu_folds_through_the_stack() {
    let mut s = ProtocolStack::new();
    s.set_transport_mtu(64);
    s.push(Crc8Layer::new());
    assert_eq!(s.mtu(), 63);
    s.push(AsciiEscapeLayer::new(false));
    assert_eq!(s.mtu(), 31);
    s.push(DebugArqLayer::new(0));
    assert_eq!(s.mtu(), 27);
    s.push(SegmentationLayer::new(0));
    assert_eq!(s.mtu(), 0);
}

#[test]
fn arq_acks_a_reset_and_delivers_in_sequence() {
    let mut s = stack_with(ArqLayer::new(0));

    // Peer reset plus the ack of our own queued reset.
    let delivered = s.decode(&[0x80, 0x40]);
    assert!(delivered.is_empty());
    assert_eq!(s.take_tx(), vec![vec![0x80]]);

    // First real message.
    let delivered = s.decode(&[0x01, b' ', b'1']);
    assert_eq!(delivered, vec![b" 1".to_vec()]);
    assert_eq!(s.take_tx(), vec![vec![0x81]]);
}

#[test]
fn arq_retransmitted_messages_are_acked_but_not_redelivered() {
    let mut s = stack_with(ArqLayer::new(0));
    s.decode(&[0x80, 0x40]);
    s.take_tx();

    assert_eq!(s.decode(&[0x01, b'A']), vec![b"A".to_vec()]);
    s.take_tx();
    // Same seq again: ack only.
    assert!(s.decode(&[0x01, b'A']).is_empty());
    assert_eq!(s.take_tx(), vec![vec![0x81]]);
    // Next seq still in order.
    assert_eq!(s.decode(&[0x02, b'B']), vec![b"B".to_vec()]);
}

// Pump two ARQ stacks, dropping every frame whose running index the filter
// rejects. Returns what each side delivered upward.
fn pump_lossy(
    a: &mut ProtocolStack,
    b: &mut ProtocolStack,
    rounds: usize,
    mut keep: impl FnMut(usize) -> bool,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut to_a = Vec::new();
    let mut to_b = Vec::new();
    let mut n = 0;
    for _ in 0..rounds {
        a.flush();
        b.flush();
        let ta = a.take_tx();
        let tb = b.take_tx();
        for f in ta {
            let deliver = keep(n);
            n += 1;
            if deliver {
                to_b.extend(b.decode(&f));
            }
        }
        for f in tb {
            let deliver = keep(n);
            n += 1;
            if deliver {
                to_a.extend(a.decode(&f));
            }
        }
    }
    (to_a, to_b)
}

#[test]
fn arq_pair_delivers_exactly_once_in_order_under_loss() {
    let mut a = stack_with(ArqLayer::new(0));
    let mut b = stack_with(ArqLayer::new(0));

    // Let the reset handshake settle first.
    let (h_a, h_b) = pump_lossy(&mut a, &mut b, 8, |_| true);
    assert!(h_a.is_empty() && h_b.is_empty());

    a.encode(b"m1");
    a.encode(b"m2");
    a.encode(b"m3");
    b.encode(b"n1");

    // Drop every third frame.
    let (to_a, to_b) = pump_lossy(&mut a, &mut b, 200, |n| n % 3 != 2);

    assert_eq!(to_b, vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]);
    assert_eq!(to_a, vec![b"n1".to_vec()]);
}

#[test]
fn arq_keep_alive_probes_the_link() {
    let mut s = stack_with(ArqLayer::new(0));
    // Drain the initial reset via a peer ack.
    s.decode(&[0x80]);
    s.take_tx();

    s.with_layer::<ArqLayer, _>(0, |arq, io| arq.keep_alive(io))
        .expect("arq at the bottom");
    let tx = s.take_tx();
    assert_eq!(tx, vec![vec![0x41]], "nop with the next seq");
}

#[test]
fn arq_overflow_event_can_drop_the_message() {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut arq = ArqLayer::new(8);
    let overflows = Rc::new(Cell::new(0));
    let o = overflows.clone();
    arq.set_callback(Box::new(move |e| {
        if e == ArqEvent::EncodeBufferOverflow {
            o.set(o.get() + 1);
            true
        } else {
            false
        }
    }));
    let mut s = stack_with(arq);

    s.encode(b"12345");
    assert_eq!(overflows.get(), 0);
    s.encode(b"this one exceeds the bound");
    assert_eq!(overflows.get(), 1);
}

#[test]
fn debug_arq_buffers_precious_responses_for_retransmits() {
    let mut s = stack_with(DebugArqLayer::new(0));

    let delivered = s.decode(&[0x01, b'e', b'X']);
    assert_eq!(delivered, vec![b"eX".to_vec()]);
    Responder::write(&mut s, b"RESP", true);
    assert_eq!(s.take_tx(), vec![b"\x81RESP".to_vec()]);

    // Retransmitted request: identical bytes come back, nothing is
    // re-executed.
    assert!(s.decode(&[0x01, b'e', b'X']).is_empty());
    assert_eq!(s.take_tx(), vec![b"\x81RESP".to_vec()]);

    // The next request invalidates the buffer.
    let delivered = s.decode(&[0x02, b'e', b'Y']);
    assert_eq!(delivered, vec![b"eY".to_vec()]);
    Responder::write(&mut s, b"R2", true);
    assert_eq!(s.take_tx(), vec![b"\x02R2".to_vec()]);
}

#[test]
fn debug_arq_reexecutes_purgeable_responses() {
    let mut s = stack_with(DebugArqLayer::new(0));

    assert_eq!(s.decode(&[0x01, b'r', b'x']), vec![b"rx".to_vec()]);
    s.set_purgeable(true);
    Responder::write(&mut s, b"AB", true);
    assert_eq!(s.take_tx(), vec![b"\x81AB".to_vec()]);

    // A retransmit must re-execute the command.
    assert_eq!(s.decode(&[0x01, b'r', b'x']), vec![b"rx".to_vec()]);
    Responder::write(&mut s, b"CD", true);
    // Content may differ; the reset flag warns the peer.
    assert_eq!(s.take_tx(), vec![b"\x82CD".to_vec()]);
}

#[test]
fn debug_arq_reset_restarts_both_directions() {
    let mut s = stack_with(DebugArqLayer::new(0));
    assert!(s.decode(&[0x80]).is_empty());
    assert_eq!(s.take_tx(), vec![vec![0x80]]);

    assert_eq!(s.decode(&[0x01, b'q']), vec![b"q".to_vec()]);
    Responder::write(&mut s, b"z", true);
    // The encode side restarts from 1, with the reset flag cleared by the
    // inbound reset.
    assert_eq!(s.take_tx(), vec![b"\x01z".to_vec()]);
}

#[test]
fn idle_layer_feeds_a_callback_pollable() {
    use crate::poller::{CustomPoller, Events, LoopBackend, Pollable, Poller, Source};

    let idle = IdleLayer::new();
    let activity = idle.activity();
    let mut s = stack_with(idle);

    let mut poller = CustomPoller::with_backend(LoopBackend::default());
    let mut seen = 0u64;
    let watched = activity.clone();
    poller
        .add(Pollable::new(
            Source::Callback(Box::new(move |interest| {
                let now = watched.get();
                if now != seen {
                    seen = now;
                    interest
                } else {
                    Events::empty()
                }
            })),
            Events::IN,
        ))
        .unwrap();

    assert!(poller.poll(0).is_err(), "no traffic yet");
    s.encode(b"tick");
    assert_eq!(activity.get(), 1);
    assert!(poller.poll(0).is_ok());
    assert!(poller.poll(0).is_err(), "level settles until more traffic");
}

#[test]
fn loopback_shuttles_between_stacks() {
    let mut lo = Loopback::new(
        stack_with(Crc8Layer::new()),
        stack_with(Crc8Layer::new()),
    );
    lo.a.encode(b"ping");
    lo.b.encode(b"pong");
    let (to_a, to_b) = lo.pump();
    assert_eq!(to_b, vec![b"ping".to_vec()]);
    assert_eq!(to_a, vec![b"pong".to_vec()]);
}

#[test]
fn fifo_loopback_carries_frames_and_counts_drops() {
    let mut lo: FifoLoopback<64, 4> =
        FifoLoopback::new(ProtocolStack::new(), ProtocolStack::new());
    lo.a.encode(b"one");
    lo.b.encode(b"two");
    let (to_a, to_b) = lo.pump();
    assert_eq!(to_b, vec![b"one".to_vec()]);
    assert_eq!(to_a, vec![b"two".to_vec()]);
    assert_eq!(lo.dropped(), 0);

    // A frame bigger than the fifo is dropped, not wedged.
    lo.a.encode(&[b'x'; 128]);
    let _ = lo.pump();
    assert_eq!(lo.dropped(), 1);
}
