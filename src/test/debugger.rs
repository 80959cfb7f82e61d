use crate::debugger::{decode_hex, encode_hex, Debugger, DebuggerConfig};
use crate::protocol::ascii::AsciiEscapeLayer;
use crate::protocol::crc::Crc8Layer;
use crate::protocol::{BufferResponder, ProtocolStack};
use crate::test::{test_store, test_store_handle, test_store_named};
use crate::types::{Endian, TypeTag};

fn debugger_with_store() -> Debugger {
    let mut d = Debugger::new(DebuggerConfig::default());
    d.map(test_store_handle(), None);
    d
}

fn run(d: &mut Debugger, req: &[u8]) -> Vec<u8> {
    let mut resp = BufferResponder::default();
    d.process(req, &mut resp);
    resp.data
}

#[test]
fn capabilities_lists_every_enabled_command() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"?"), b"?rwelamvRWst");

    d.set_identification("unit");
    assert_eq!(run(&mut d, b"?"), b"?rwelamivRWst");

    let mut compressed = Debugger::new(DebuggerConfig {
        compress_streams: true,
        ..DebuggerConfig::default()
    });
    compressed.map(test_store_handle(), None);
    assert_eq!(run(&mut compressed, b"?"), b"?rwelamvRWstf");
}

#[test]
fn write_then_read_an_int8() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"w10/default int8"), b"!");
    assert_eq!(run(&mut d, b"r/default int8"), b"10");
}

#[test]
fn read_trims_leading_zeros_of_integers() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"w0012/default int16"), b"!");
    assert_eq!(run(&mut d, b"r/default int16"), b"12");
    assert_eq!(run(&mut d, b"r/default uint32"), b"0");
    assert_eq!(run(&mut d, b"r/flag"), b"0");
    assert_eq!(run(&mut d, b"w1/flag"), b"!");
    assert_eq!(run(&mut d, b"r/flag"), b"1");
}

#[test]
fn doubles_keep_their_full_width() {
    let mut d = debugger_with_store();
    // 2.5 in IEEE 754 binary64.
    assert_eq!(run(&mut d, b"w4004000000000000/default double"), b"!");
    assert_eq!(run(&mut d, b"r/default double"), b"4004000000000000");
}

#[test]
fn unknown_paths_and_opcodes_nack() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"r/nope"), b"?");
    assert_eq!(run(&mut d, b"wff/nope"), b"?");
    assert_eq!(run(&mut d, b"#"), b"?");
    assert_eq!(run(&mut d, b"rxx"), b"?");
}

#[test]
fn echo_returns_the_payload() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"e hi there"), b" hi there");
    assert_eq!(run(&mut d, b"e"), b"");
}

#[test]
fn aliases_bind_and_release() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"aa/default int16"), b"!");
    assert_eq!(run(&mut d, b"w12a"), b"!");
    assert_eq!(run(&mut d, b"ra"), b"12");

    // Erase, then the alias no longer resolves.
    assert_eq!(run(&mut d, b"aa"), b"!");
    assert_eq!(run(&mut d, b"ra"), b"?");

    // Alias chars outside [0x20, 0x7e] or '/' are rejected.
    assert_eq!(run(&mut d, b"a\x1f/flag"), b"?");
    assert_eq!(run(&mut d, b"a//flag"), b"?");
}

#[test]
fn alias_table_overflow_only_allows_replacement() {
    let mut d = Debugger::new(DebuggerConfig {
        alias_slots: 2,
        ..DebuggerConfig::default()
    });
    d.map(test_store_handle(), None);
    assert_eq!(run(&mut d, b"aa/default int8"), b"!");
    assert_eq!(run(&mut d, b"ab/default int16"), b"!");
    assert_eq!(run(&mut d, b"ac/flag"), b"?");
    // Rebinding an existing alias is fine.
    assert_eq!(run(&mut d, b"aa/flag"), b"!");
}

#[test]
fn macro_defines_and_runs() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"m1;r/default uint8"), b"!");
    assert_eq!(run(&mut d, b"w2/default uint8"), b"!");
    assert_eq!(run(&mut d, b"1"), b"2");
}

#[test]
fn macro_segments_concatenate_with_echo_separators() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"w3/default int8"), b"!");
    assert_eq!(run(&mut d, b"w7/default uint8"), b"!");
    assert_eq!(run(&mut d, b"mT|r/default int8|e,|r/default uint8"), b"!");
    assert_eq!(run(&mut d, b"T"), b"3,7");
}

#[test]
fn macros_do_not_recurse() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"mQ;Q;e!done"), b"!");
    // The inner Q finds the definition swapped out and nacks.
    assert_eq!(run(&mut d, b"Q"), b"?!done");
}

#[test]
fn macro_budget_is_enforced() {
    let mut d = Debugger::new(DebuggerConfig {
        macro_bytes: 10,
        ..DebuggerConfig::default()
    });
    d.map(test_store_handle(), None);
    assert_eq!(run(&mut d, b"m1;e12345678"), b"!"); // 10 bytes of body
    assert_eq!(run(&mut d, b"m2;e1"), b"?"); // would exceed the budget
    assert_eq!(run(&mut d, b"m1;e1"), b"!"); // shrinking is fine
    assert_eq!(run(&mut d, b"m2;e1"), b"!"); // now it fits
}

#[test]
fn identification_and_version() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"i"), b"?");
    d.set_identification("myapp");
    assert_eq!(run(&mut d, b"i"), b"myapp");

    d.set_versions("7.1");
    let v = run(&mut d, b"v");
    assert!(v.starts_with(b"2 7.1"), "{:?}", String::from_utf8_lossy(&v));
}

#[test]
fn raw_memory_window_reads_and_writes() {
    let mut d = debugger_with_store();
    d.set_memory_window(vec![0; 64]);

    assert_eq!(run(&mut d, b"R0 4"), b"00000000");
    assert_eq!(run(&mut d, b"W4 deadbeef"), b"!");
    assert_eq!(run(&mut d, b"R4 4"), b"deadbeef");
    // Default length is one machine word.
    assert_eq!(run(&mut d, b"R0").len(), 2 * std::mem::size_of::<usize>());
    // Out of window.
    assert_eq!(run(&mut d, b"R40 20"), b"?");
    assert_eq!(run(&mut d, b"W3f beef"), b"?");
    // Odd number of nibbles.
    assert_eq!(run(&mut d, b"W0 abc"), b"?");
}

#[test]
fn list_enumerates_all_objects() {
    let mut d = debugger_with_store();
    let listing = String::from_utf8(run(&mut d, b"l")).unwrap();
    insta::assert_snapshot!(listing, @r"
    014/blob b
    2f8/default double
    392/default int16
    381/default int8
    334/default uint32
    301/default uint8
    201/flag
    028/name
    734/time (s)
    ");
}

#[test]
fn list_prefixes_names_with_multiple_stores() {
    let mut d = Debugger::new(DebuggerConfig::default());
    d.map(test_store_named("/a", Endian::Little).into_handle(), None);
    d.map(test_store_named("/b", Endian::Little).into_handle(), None);
    let listing = String::from_utf8(run(&mut d, b"l")).unwrap();
    assert!(listing.contains("381/a/default int8\n"));
    assert!(listing.contains("381/b/default int8\n"));

    // Paths need the prefix now, abbreviated is fine when unambiguous.
    assert_eq!(run(&mut d, b"w22/a/default int8"), b"!");
    assert_eq!(run(&mut d, b"r/a/default int8"), b"22");
    assert_eq!(run(&mut d, b"r/default int8"), b"?");
    assert_eq!(run(&mut d, b"r/b/default int8"), b"0");
}

#[test]
fn single_store_accepts_the_optional_prefix() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"w55/test/default uint8"), b"!");
    assert_eq!(run(&mut d, b"r/default uint8"), b"55");
}

#[test]
fn functions_read_through_the_callback() {
    let store = test_store();
    let handle = store.into_handle();
    let mut ticks = 0u32;
    handle
        .borrow_mut()
        .set_functions(Box::new(move |set, buffer, id| {
            assert_eq!(id, 1);
            if !set {
                ticks += 7;
                buffer[..4].copy_from_slice(&ticks.to_le_bytes());
            }
            4
        }));
    let mut d = Debugger::new(DebuggerConfig::default());
    d.map(handle, None);

    assert_eq!(run(&mut d, b"r/time (s)"), b"7");
    assert_eq!(run(&mut d, b"r/time (s)"), b"e");
}

#[test]
fn streams_fill_list_and_drain() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"s"), b"?", "no stream has data yet");

    assert_eq!(d.stream_write(b'A', b"hello "), 6);
    assert_eq!(d.stream_write(b'B', b"other"), 5);
    assert_eq!(run(&mut d, b"s"), b"AB");

    // Draining returns data plus the verbatim suffix.
    assert_eq!(run(&mut d, b"sAxyz"), b"hello xyz");
    // Read-once: the data is gone, the suffix remains.
    assert_eq!(run(&mut d, b"sAxyz"), b"xyz");
    assert_eq!(run(&mut d, b"s"), b"B");
    assert_eq!(run(&mut d, b"sZ"), b"?", "unknown stream");
}

#[test]
fn stream_table_recycles_empty_streams() {
    let mut d = Debugger::new(DebuggerConfig {
        stream_slots: 2,
        ..DebuggerConfig::default()
    });
    d.map(test_store_handle(), None);
    assert_eq!(d.stream_write(b'A', b"a"), 1);
    assert_eq!(d.stream_write(b'B', b"b"), 1);
    // Table full, nothing empty: no slot for C.
    assert_eq!(d.stream_write(b'C', b"c"), 0);
    // Drain B; its slot can be recycled.
    assert_eq!(run(&mut d, b"sB"), b"b");
    assert_eq!(d.stream_write(b'C', b"c"), 1);
    assert_eq!(run(&mut d, b"sC"), b"c");
}

#[test]
fn stream_question_mark_name_is_reserved() {
    let mut d = debugger_with_store();
    assert_eq!(d.stream_write(b'?', b"x"), 0);
}

#[test]
fn flush_compresses_and_blocks_until_read() {
    let mut d = Debugger::new(DebuggerConfig {
        compress_streams: true,
        ..DebuggerConfig::default()
    });
    d.map(test_store_handle(), None);

    let payload = b"stream data that compresses, compresses, compresses";
    assert!(d.stream_write(b'T', payload) > 0);
    assert_eq!(run(&mut d, b"fT"), b"!");

    // While blocked, new samples are dropped.
    assert_eq!(d.stream_write(b'T', b"lost"), 0);

    let compressed = run(&mut d, b"sT");
    assert!(!compressed.is_empty());
    assert_eq!(inflate(&compressed), payload);

    // Unknown names still ack; flushing everything too.
    assert_eq!(run(&mut d, b"fZ"), b"!");
    assert_eq!(run(&mut d, b"f"), b"!");
}

#[test]
fn trace_samples_into_a_stream_with_decimation() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"w5/default uint8"), b"!");
    assert_eq!(run(&mut d, b"mM|r/default uint8|e,"), b"!");
    assert_eq!(run(&mut d, b"tMS2"), b"!");
    assert!(d.tracing());

    for _ in 0..6 {
        d.trace();
    }
    assert_eq!(run(&mut d, b"sS"), b"5,5,5,");

    // Disable.
    assert_eq!(run(&mut d, b"t"), b"!");
    assert!(!d.tracing());
    d.trace();
    assert_eq!(run(&mut d, b"s"), b"?", "nothing traced while disabled");
}

#[test]
fn trace_drops_samples_when_the_stream_is_full() {
    let mut d = Debugger::new(DebuggerConfig {
        stream_buffer: 8,
        stream_overflow: 4,
        ..DebuggerConfig::default()
    });
    d.map(test_store_handle(), None);
    assert_eq!(run(&mut d, b"mM|eabc"), b"!");
    assert_eq!(run(&mut d, b"tMS"), b"!");
    for _ in 0..10 {
        d.trace();
    }
    // Sampling stops once less than the overflow margin is free.
    let data = run(&mut d, b"sS");
    assert!(data.len() <= 12, "{}", data.len());
    assert!(data.starts_with(b"abc"));
}

#[test]
fn bad_trace_requests_nack() {
    let mut d = debugger_with_store();
    assert_eq!(run(&mut d, b"tM"), b"?");
    assert_eq!(run(&mut d, b"tMSzz"), b"?");
}

#[test]
fn hex_codec_is_big_endian_regardless_of_store_order() {
    let le = encode_hex(Endian::Little, TypeTag::UINT32, &[0x44, 0x33, 0x22, 0x11], false);
    assert_eq!(le, b"11223344");
    let be = encode_hex(Endian::Big, TypeTag::UINT32, &[0x11, 0x22, 0x33, 0x44], false);
    assert_eq!(be, b"11223344");

    assert_eq!(
        decode_hex(Endian::Little, TypeTag::UINT32, b"11223344").unwrap(),
        vec![0x44, 0x33, 0x22, 0x11]
    );
    assert_eq!(
        decode_hex(Endian::Big, TypeTag::UINT32, b"11223344").unwrap(),
        vec![0x11, 0x22, 0x33, 0x44]
    );
    // Short hex strings are zero-extended.
    assert_eq!(
        decode_hex(Endian::Little, TypeTag::UINT32, b"7").unwrap(),
        vec![7, 0, 0, 0]
    );
    // Too long is refused.
    assert!(decode_hex(Endian::Little, TypeTag::UINT8, b"123").is_none());
    // Blobs need whole bytes.
    assert!(decode_hex(Endian::Little, TypeTag::BLOB, b"abc").is_none());
}

#[test]
fn big_endian_store_reads_the_same_hex() {
    let mut d = Debugger::new(DebuggerConfig::default());
    d.map(test_store_named("/be", Endian::Big).into_handle(), None);
    assert_eq!(run(&mut d, b"wcafe/default int16"), b"!");
    assert_eq!(run(&mut d, b"r/default int16"), b"cafe");
}

#[test]
fn debugger_behind_a_real_stack() {
    let mut server = ProtocolStack::new();
    server.push(AsciiEscapeLayer::new(false));
    server.push(Crc8Layer::new());
    let mut client = ProtocolStack::new();
    client.push(AsciiEscapeLayer::new(false));
    client.push(Crc8Layer::new());

    let mut d = debugger_with_store();

    let mut transact = |client: &mut ProtocolStack, server: &mut ProtocolStack, req: &[u8]| {
        client.encode(req);
        for wire in client.take_tx() {
            for frame in server.decode(&wire) {
                d.process(&frame, server);
            }
        }
        let mut resp = Vec::new();
        for wire in server.take_tx() {
            for frame in client.decode(&wire) {
                resp.extend(frame);
            }
        }
        resp
    };

    assert_eq!(transact(&mut client, &mut server, b"w42/default uint8"), b"!");
    assert_eq!(transact(&mut client, &mut server, b"r/default uint8"), b"42");
    assert_eq!(transact(&mut client, &mut server, b"e\x00\x1b\r"), b"\x00\x1b\r");
}

fn inflate(data: &[u8]) -> Vec<u8> {
    use flate2::{Decompress, FlushDecompress, Status};
    let mut d = Decompress::new(true);
    let mut out = Vec::with_capacity(data.len() * 8 + 64);
    loop {
        let before = d.total_in();
        out.reserve(256);
        let status = d
            .decompress_vec(&data[d.total_in() as usize..], &mut out, FlushDecompress::Finish)
            .unwrap();
        if status == Status::StreamEnd || d.total_in() == before {
            return out;
        }
    }
}
