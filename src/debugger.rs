//! The debugger: a request/response command processor over one or more
//! mapped stores.
//!
//! Requests are single frames; the first byte selects the command. Unknown
//! opcodes fall back to macro execution. Responses go into a [`Responder`],
//! usually the top of a protocol stack.

pub mod stream;

use std::collections::BTreeMap;

use crate::protocol::Responder;
use crate::scratchpad::ScratchPad;
use crate::store::{StoreHandle, Variant};
use crate::types::{Endian, TypeTag};
use stream::Stream;

pub const CMD_CAPABILITIES: u8 = b'?';
pub const CMD_READ: u8 = b'r';
pub const CMD_WRITE: u8 = b'w';
pub const CMD_ECHO: u8 = b'e';
pub const CMD_LIST: u8 = b'l';
pub const CMD_ALIAS: u8 = b'a';
pub const CMD_MACRO: u8 = b'm';
pub const CMD_IDENTIFICATION: u8 = b'i';
pub const CMD_VERSION: u8 = b'v';
pub const CMD_READ_MEM: u8 = b'R';
pub const CMD_WRITE_MEM: u8 = b'W';
pub const CMD_STREAM: u8 = b's';
pub const CMD_FLUSH: u8 = b'f';
pub const CMD_TRACE: u8 = b't';

pub const ACK: u8 = b'!';
pub const NACK: u8 = b'?';

/// Feature switches and bounds; [`Debugger::capabilities`] reflects them.
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub read: bool,
    pub write: bool,
    pub echo: bool,
    pub list: bool,
    /// Maximum number of aliases; 0 disables the command.
    pub alias_slots: usize,
    /// Byte budget over all macro definitions; 0 disables the command.
    pub macro_bytes: usize,
    /// Maximum number of streams; 0 disables the command.
    pub stream_slots: usize,
    /// Soft cap per stream buffer.
    pub stream_buffer: usize,
    /// Overflow margin on top of the soft cap, sized to one trace sample.
    pub stream_overflow: usize,
    pub compress_streams: bool,
    pub read_mem: bool,
    pub write_mem: bool,
    pub trace: bool,
    /// Debug protocol version reported by `v`.
    pub version: u16,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        DebuggerConfig {
            read: true,
            write: true,
            echo: true,
            list: true,
            alias_slots: 16,
            macro_bytes: 512,
            stream_slots: 4,
            stream_buffer: 1024,
            stream_overflow: 64,
            compress_streams: false,
            read_mem: true,
            write_mem: true,
            trace: true,
            version: 2,
        }
    }
}

/// A resolved object: the owning store plus the erased handle into it.
#[derive(Clone)]
pub struct DebugVariant {
    pub store: StoreHandle,
    pub variant: Variant,
}

impl DebugVariant {
    pub fn get(&self, dst: &mut [u8]) -> usize {
        self.store.borrow_mut().get(self.variant, dst)
    }

    pub fn set(&self, src: &[u8]) -> usize {
        self.store.borrow_mut().set(self.variant, src)
    }

    fn endian(&self) -> Endian {
        self.store.borrow().endian()
    }
}

enum Outcome {
    Done,
    Ack,
    Nack,
}

pub struct Debugger {
    config: DebuggerConfig,
    identification: Option<String>,
    versions: Option<String>,
    stores: BTreeMap<String, StoreHandle>,
    aliases: BTreeMap<u8, DebugVariant>,
    macros: BTreeMap<u8, Vec<u8>>,
    macro_size: usize,
    streams: BTreeMap<u8, Stream>,
    /// Window the raw-memory commands operate on.
    memory: Vec<u8>,
    trace_macro: u8,
    trace_stream: u8,
    trace_decimate: u32,
    trace_count: u32,
    spm: ScratchPad,
}

impl Debugger {
    pub fn new(config: DebuggerConfig) -> Self {
        Debugger {
            config,
            identification: None,
            versions: None,
            stores: BTreeMap::new(),
            aliases: BTreeMap::new(),
            macros: BTreeMap::new(),
            macro_size: 0,
            streams: BTreeMap::new(),
            memory: Vec::new(),
            trace_macro: 0,
            trace_stream: 0,
            trace_decimate: 0,
            trace_count: 0,
            spm: ScratchPad::new(),
        }
    }

    pub fn set_identification(&mut self, id: &str) {
        self.identification = Some(id.to_string());
    }

    pub fn set_versions(&mut self, versions: &str) {
        self.versions = Some(versions.to_string());
    }

    /// Register the window the `R`/`W` raw-memory commands address.
    pub fn set_memory_window(&mut self, memory: Vec<u8>) {
        self.memory = memory;
    }

    pub fn memory_window(&self) -> &[u8] {
        &self.memory
    }

    /// Map a store under its own name, or a caller-chosen `/`-prefixed
    /// alias. Remapping an existing name replaces it.
    pub fn map(&mut self, store: StoreHandle, name: Option<&str>) {
        let name = match name {
            Some(n) => n.to_string(),
            None => store.borrow().name().to_string(),
        };
        if !name.starts_with('/') || name[1..].contains('/') {
            return;
        }
        self.stores.insert(name, store);
    }

    pub fn unmap(&mut self, name: &str) {
        self.stores.remove(name);
    }

    pub fn stores(&self) -> &BTreeMap<String, StoreHandle> {
        &self.stores
    }

    pub fn spm(&self) -> &ScratchPad {
        &self.spm
    }

    /// The capability string returned by `?`.
    pub fn capabilities(&self) -> Vec<u8> {
        let c = &self.config;
        let mut caps = vec![CMD_CAPABILITIES];
        if c.read {
            caps.push(CMD_READ);
        }
        if c.write {
            caps.push(CMD_WRITE);
        }
        if c.echo {
            caps.push(CMD_ECHO);
        }
        if c.list {
            caps.push(CMD_LIST);
        }
        if c.alias_slots > 0 {
            caps.push(CMD_ALIAS);
        }
        if c.macro_bytes > 0 {
            caps.push(CMD_MACRO);
        }
        if self.identification.is_some() {
            caps.push(CMD_IDENTIFICATION);
        }
        if c.version > 0 {
            caps.push(CMD_VERSION);
        }
        if c.read_mem {
            caps.push(CMD_READ_MEM);
        }
        if c.write_mem {
            caps.push(CMD_WRITE_MEM);
        }
        if c.stream_slots > 0 && c.stream_buffer > 0 {
            caps.push(CMD_STREAM);
        }
        if c.trace {
            caps.push(CMD_TRACE);
        }
        if c.compress_streams {
            caps.push(CMD_FLUSH);
        }
        caps
    }

    /// Resolve a path or alias to an object.
    ///
    /// `/` anchors at the store root. With a single mapped store the store
    /// prefix is optional; with several, the full prefix or an unambiguous
    /// shortening selects the store.
    pub fn find(&self, name: &[u8]) -> Option<DebugVariant> {
        if name.is_empty() {
            return None;
        }

        if self.config.alias_slots > 0 && name.len() == 1 && name[0] != b'/' {
            return self.aliases.get(&name[0]).cloned();
        }

        match self.stores.len() {
            0 => None,
            1 => {
                let (store_name, store) = self.stores.iter().next().expect("one store");
                // The optional store prefix binds stronger than a direct
                // lookup, which could otherwise skip-over-match it.
                if let Some(rest) = name.strip_prefix(store_name.as_bytes()) {
                    if rest.first() == Some(&b'/') {
                        let v = store.borrow().find(rest);
                        if v.valid() {
                            return Some(DebugVariant {
                                store: store.clone(),
                                variant: v,
                            });
                        }
                    }
                }
                let v = store.borrow().find(name);
                v.valid().then(|| DebugVariant {
                    store: store.clone(),
                    variant: v,
                })
            }
            _ => {
                let mut prefix_len = 1;
                while prefix_len < name.len() && name[prefix_len] != b'/' {
                    prefix_len += 1;
                }
                if prefix_len == name.len() {
                    return None;
                }
                let prefix = std::str::from_utf8(&name[..prefix_len]).ok()?;
                let store = self.match_prefix(prefix)?;
                let v = store.borrow().find(&name[prefix_len..]);
                v.valid().then(|| DebugVariant {
                    store: store.clone(),
                    variant: v,
                })
            }
        }
    }

    // Lower-bound search over the prefix-sorted store names. A candidate
    // matches when it equals the prefix, or is the only name starting with
    // it.
    fn match_prefix(&self, prefix: &str) -> Option<&StoreHandle> {
        let mut range = self.stores.range(prefix.to_string()..);
        let (first_name, first) = range.next()?;
        if first_name == prefix {
            return Some(first);
        }
        if !first_name.starts_with(prefix) {
            return None;
        }
        match range.next() {
            Some((next_name, _)) if next_name.starts_with(prefix) => None,
            _ => Some(first),
        }
    }

    /// Process one request frame, producing exactly one response.
    pub fn process(&mut self, frame: &[u8], response: &mut dyn Responder) {
        if frame.is_empty() {
            return;
        }

        let outcome = self.dispatch(frame, response);
        match outcome {
            Outcome::Done => {}
            Outcome::Ack => response.write(&[ACK], true),
            Outcome::Nack => response.write(&[NACK], true),
        }
    }

    fn dispatch(&mut self, frame: &[u8], response: &mut dyn Responder) -> Outcome {
        let arg = &frame[1..];
        match frame[0] {
            CMD_CAPABILITIES => {
                response.set_purgeable(true);
                let caps = self.capabilities();
                response.write(&caps, true);
                Outcome::Done
            }
            CMD_READ if self.config.read => self.cmd_read(arg, response),
            CMD_WRITE if self.config.write => self.cmd_write(arg),
            CMD_ECHO if self.config.echo => {
                response.set_purgeable(true);
                response.write(arg, true);
                Outcome::Done
            }
            CMD_LIST if self.config.list => self.cmd_list(response),
            CMD_ALIAS if self.config.alias_slots > 0 => self.cmd_alias(arg),
            CMD_MACRO if self.config.macro_bytes > 0 => self.cmd_macro(arg),
            CMD_IDENTIFICATION => match self.identification.clone() {
                Some(id) if !id.is_empty() => {
                    response.set_purgeable(true);
                    response.write(id.as_bytes(), true);
                    Outcome::Done
                }
                _ => Outcome::Nack,
            },
            CMD_VERSION if self.config.version > 0 => {
                response.set_purgeable(true);
                let mut v = format!("{:x}", self.config.version);
                if let Some(app) = &self.versions {
                    if !app.is_empty() {
                        v.push(' ');
                        v.push_str(app);
                    }
                }
                if cfg!(debug_assertions) {
                    v.push_str(" debug");
                }
                response.write(v.as_bytes(), true);
                Outcome::Done
            }
            CMD_READ_MEM if self.config.read_mem => self.cmd_read_mem(arg, response),
            CMD_WRITE_MEM if self.config.write_mem => self.cmd_write_mem(arg),
            CMD_STREAM if self.config.stream_slots > 0 => self.cmd_stream(arg, response),
            CMD_FLUSH if self.config.compress_streams => self.cmd_flush(arg),
            CMD_TRACE if self.config.trace => self.cmd_trace(arg),
            _ => {
                // Unknown opcode: attempt a macro of that name.
                if self.config.macro_bytes > 0
                    && !self.macros.is_empty()
                    && self.run_macro(frame[0], response)
                {
                    Outcome::Done
                } else {
                    Outcome::Nack
                }
            }
        }
    }

    fn cmd_read(&mut self, path: &[u8], response: &mut dyn Responder) -> Outcome {
        let Some(v) = self.find(path) else {
            return Outcome::Nack;
        };
        if v.variant.is_variable() {
            response.set_purgeable(true);
        }
        let bump = self.spm.begin();
        let data = bump.alloc_slice_fill_copy(v.variant.size(), 0u8);
        let n = v.get(data);
        let hex = encode_hex(v.endian(), v.variant.tag(), &data[..n], true);
        response.write(&hex, true);
        self.spm.end(bump);
        Outcome::Done
    }

    fn cmd_write(&mut self, arg: &[u8]) -> Outcome {
        // Hex value runs until the path, which starts at `/` or is a
        // trailing alias byte.
        let mut split = 0;
        while split + 1 < arg.len() && arg[split] != b'/' {
            split += 1;
        }
        if arg.is_empty() {
            return Outcome::Nack;
        }
        let (value, path) = arg.split_at(split);
        let Some(v) = self.find(path) else {
            return Outcome::Nack;
        };
        let Some(raw) = decode_hex(v.endian(), v.variant.tag(), value) else {
            return Outcome::Nack;
        };
        v.set(&raw);
        Outcome::Ack
    }

    fn cmd_list(&mut self, response: &mut dyn Responder) -> Outcome {
        let single = self.stores.len() == 1;
        response.set_purgeable(true);
        let mut count = 0usize;
        for (prefix, store) in &self.stores {
            let store = store.borrow();
            let mut emit = |name: &str, v: Variant| {
                let mut line = format!("{:02x}", v.tag().0);
                let size_hex = encode_hex_usize(v.size());
                line.push_str(&size_hex);
                if !single {
                    line.push_str(prefix);
                }
                line.push_str(name);
                line.push('\n');
                response.write(line.as_bytes(), false);
                count += 1;
            };
            if store.list(&mut emit).is_err() {
                return Outcome::Nack;
            }
        }
        if count == 0 {
            return Outcome::Nack;
        }
        response.write(&[], true);
        Outcome::Done
    }

    fn cmd_alias(&mut self, arg: &[u8]) -> Outcome {
        let Some(&a) = arg.first() else {
            return Outcome::Nack;
        };
        if !(0x20..=0x7e).contains(&a) || a == b'/' {
            return Outcome::Nack;
        }
        if arg.len() == 1 {
            self.aliases.remove(&a);
            return Outcome::Ack;
        }
        let Some(v) = self.find(&arg[1..]) else {
            return Outcome::Nack;
        };
        if self.aliases.len() >= self.config.alias_slots && !self.aliases.contains_key(&a) {
            // Only accept an alias that replaces one.
            return Outcome::Nack;
        }
        self.aliases.insert(a, v);
        Outcome::Ack
    }

    fn cmd_macro(&mut self, arg: &[u8]) -> Outcome {
        let Some(&m) = arg.first() else {
            return Outcome::Nack;
        };
        let body = &arg[1..];

        if body.is_empty() {
            let Some(def_len) = self.macros.get(&m).map(Vec::len) else {
                return Outcome::Ack;
            };
            if def_len == 0 {
                // Currently executing.
                return Outcome::Nack;
            }
            self.macros.remove(&m);
            self.macro_size -= def_len;
            return Outcome::Ack;
        }

        let old = self.macros.get(&m).map(Vec::len).unwrap_or(0);
        if self.macros.get(&m).is_some_and(|def| def.is_empty()) {
            // Currently executing.
            return Outcome::Nack;
        }
        let new_total = self.macro_size - old + body.len();
        if new_total > self.config.macro_bytes {
            return Outcome::Nack;
        }
        self.macros.insert(m, body.to_vec());
        self.macro_size = new_total;
        Outcome::Ack
    }

    fn cmd_read_mem(&mut self, arg: &[u8], response: &mut dyn Responder) -> Outcome {
        if arg.is_empty() {
            return Outcome::Nack;
        }
        let (addr_hex, rest) = split_at_space(arg);
        let Some(addr) = parse_hex_u64(addr_hex) else {
            return Outcome::Nack;
        };
        let len = match rest {
            None => std::mem::size_of::<usize>(),
            Some(len_hex) => match parse_hex_u64(len_hex) {
                Some(0) | None => return Outcome::Nack,
                Some(n) => n as usize,
            },
        };
        let addr = addr as usize;
        let Some(end) = addr.checked_add(len) else {
            return Outcome::Nack;
        };
        let Some(window) = self.memory.get(addr..end) else {
            return Outcome::Nack;
        };
        response.set_purgeable(true);
        // Chunked, so one command never needs a len-sized contiguous
        // temporary.
        for chunk in window.chunks(64) {
            let hex = encode_hex(Endian::Big, TypeTag::BLOB, chunk, false);
            response.write(&hex, false);
        }
        response.write(&[], true);
        Outcome::Done
    }

    fn cmd_write_mem(&mut self, arg: &[u8]) -> Outcome {
        let (addr_hex, rest) = split_at_space(arg);
        let Some(data_hex) = rest else {
            return Outcome::Nack;
        };
        let Some(addr) = parse_hex_u64(addr_hex) else {
            return Outcome::Nack;
        };
        if data_hex.is_empty() || data_hex.len() % 2 != 0 {
            return Outcome::Nack;
        }
        let Some(raw) = decode_hex(Endian::Big, TypeTag::BLOB, data_hex) else {
            return Outcome::Nack;
        };
        let addr = addr as usize;
        let Some(end) = addr.checked_add(raw.len()) else {
            return Outcome::Nack;
        };
        let Some(window) = self.memory.get_mut(addr..end) else {
            return Outcome::Nack;
        };
        window.copy_from_slice(&raw);
        Outcome::Ack
    }

    fn cmd_stream(&mut self, arg: &[u8], response: &mut dyn Responder) -> Outcome {
        if arg.is_empty() {
            let names: Vec<u8> = self
                .streams
                .iter()
                .filter(|(_, s)| !s.empty())
                .map(|(&n, _)| n)
                .collect();
            if names.is_empty() {
                return Outcome::Nack;
            }
            response.write(&names, true);
            return Outcome::Done;
        }

        let name = arg[0];
        let suffix = &arg[1..];
        let Some(s) = self.streams.get_mut(&name) else {
            return Outcome::Nack;
        };
        if !self.config.compress_streams && self.trace_decimate > 0 && name == self.trace_stream {
            response.set_purgeable(true);
        }
        let data = s.drain();
        if !data.is_empty() {
            response.write(&data, false);
        }
        response.write(suffix, true);
        Outcome::Done
    }

    fn cmd_flush(&mut self, arg: &[u8]) -> Outcome {
        match arg.len() {
            0 => {
                for s in self.streams.values_mut() {
                    s.flush();
                }
                Outcome::Ack
            }
            1 => {
                if let Some(s) = self.streams.get_mut(&arg[0]) {
                    s.flush();
                }
                Outcome::Ack
            }
            _ => Outcome::Nack,
        }
    }

    fn cmd_trace(&mut self, arg: &[u8]) -> Outcome {
        self.trace_decimate = 0;
        if arg.is_empty() {
            return Outcome::Ack;
        }
        if arg.len() < 2 {
            return Outcome::Nack;
        }
        self.trace_macro = arg[0];
        self.trace_stream = arg[1];
        if self.stream_alloc(self.trace_stream).is_none() {
            return Outcome::Nack;
        }
        let decimate = if arg.len() > 2 {
            let hex = &arg[2..arg.len().min(2 + 8)];
            match parse_hex_u64(hex) {
                Some(d) => d as u32,
                None => return Outcome::Nack,
            }
        } else {
            1
        };
        self.trace_decimate = decimate;
        self.trace_count = 0;
        Outcome::Ack
    }

    /// Execute a macro. Its body is swapped out of the table for the
    /// duration, which both marks it in use and forbids recursion.
    pub fn run_macro(&mut self, name: u8, response: &mut dyn Responder) -> bool {
        let Some(def) = self.macros.get_mut(&name) else {
            return false;
        };
        let definition = std::mem::take(def);
        if definition.is_empty() {
            // Currently executing; no recursion.
            return false;
        }
        if definition.len() == 1 {
            // Just a separator, nothing to run.
            self.macros.insert(name, definition);
            return true;
        }

        let sep = definition[0];
        {
            let mut merger = MergeResponder { inner: response };
            for segment in definition[1..].split(|&b| b == sep) {
                self.process(segment, &mut merger);
            }
        }
        response.write(&[], true);

        self.macros.insert(name, definition);
        true
    }

    fn stream_alloc(&mut self, name: u8) -> Option<&mut Stream> {
        if self.streams.contains_key(&name) {
            return self.streams.get_mut(&name);
        }
        while self.streams.len() >= self.config.stream_slots {
            // Out of slots; recycle an empty stream if possible.
            let empty = self
                .streams
                .iter()
                .find(|(_, s)| s.empty())
                .map(|(&n, _)| n)?;
            self.streams.remove(&empty);
        }
        self.streams.insert(
            name,
            Stream::new(
                self.config.stream_buffer,
                self.config.stream_overflow,
                self.config.compress_streams,
            ),
        );
        self.streams.get_mut(&name)
    }

    /// Append application data to a stream, creating it on first use.
    /// Returns how much was accepted; the rest is silently dropped.
    pub fn stream_write(&mut self, name: u8, data: &[u8]) -> usize {
        if self.config.stream_slots == 0 || name == NACK {
            return 0;
        }
        let Some(s) = self.stream_alloc(name) else {
            return 0;
        };
        let n = s.fits(data.len());
        if n == 0 {
            return 0;
        }
        s.encode(&data[..n]);
        n
    }

    pub fn stream(&self, name: u8) -> Option<&Stream> {
        self.streams.get(&name)
    }

    pub fn tracing(&self) -> bool {
        self.config.trace && self.trace_decimate > 0
    }

    /// Trace tick: every `decimate`-th call runs the trace macro with its
    /// output appended to the trace stream. Call this at the sampling rate.
    pub fn trace(&mut self) {
        if !self.tracing() {
            return;
        }
        self.trace_count += 1;
        if self.trace_count < self.trace_decimate {
            return;
        }
        self.trace_count = 0;

        if self.stream_alloc(self.trace_stream).is_none() {
            return;
        }
        // The whole sample goes in or nothing does.
        let fits = {
            let s = &self.streams[&self.trace_stream];
            if self.config.stream_overflow > 0 {
                s.fits(self.config.stream_overflow) == self.config.stream_overflow
            } else {
                s.buffer().len() < self.config.stream_buffer
            }
        };
        if !fits {
            return;
        }

        let mut s = self.streams.remove(&self.trace_stream).expect("allocated");
        {
            let mut resp = StreamResponder { stream: &mut s };
            self.run_macro(self.trace_macro, &mut resp);
        }
        self.streams.insert(self.trace_stream, s);
    }
}

struct MergeResponder<'a> {
    inner: &'a mut dyn Responder,
}

impl Responder for MergeResponder<'_> {
    fn write(&mut self, data: &[u8], _last: bool) {
        self.inner.write(data, false);
    }
    // Purgeability of a single segment does not apply to the merged
    // response.
}

struct StreamResponder<'a> {
    stream: &'a mut Stream,
}

impl Responder for StreamResponder<'_> {
    fn write(&mut self, data: &[u8], _last: bool) {
        self.stream.encode(data);
    }
}

fn split_at_space(arg: &[u8]) -> (&[u8], Option<&[u8]>) {
    match arg.iter().position(|&b| b == b' ') {
        Some(i) => (&arg[..i], Some(&arg[i + 1..])),
        None => (arg, None),
    }
}

fn parse_hex_u64(hex: &[u8]) -> Option<u64> {
    if hex.is_empty() || hex.len() > 16 {
        return None;
    }
    let mut v: u64 = 0;
    for &c in hex {
        v = (v << 4) | u64::from(nibble(c)?);
    }
    Some(v)
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn hex_digit(n: u8) -> u8 {
    if n < 10 {
        b'0' + n
    } else {
        b'a' + n - 10
    }
}

fn encode_hex_usize(v: usize) -> String {
    format!("{v:x}")
}

/// ASCII-hex encode a value as the debug protocol wants it: fixed-size
/// values big-endian regardless of the store's byte order, other values as
/// a plain byte sequence. `shortest` trims leading zeros of integers and
/// renders bool as a single digit.
pub fn encode_hex(endian: Endian, tag: TypeTag, data: &[u8], shortest: bool) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }

    if shortest && tag.value_type() == TypeTag::BOOL {
        return vec![if data[0] != 0 { b'1' } else { b'0' }];
    }

    let mut hex = Vec::with_capacity(data.len() * 2);
    if tag.is_fixed() {
        let bytes: Vec<u8> = match endian {
            Endian::Little => data.iter().rev().copied().collect(),
            Endian::Big => data.to_vec(),
        };
        for b in bytes {
            hex.push(hex_digit(b >> 4));
            hex.push(hex_digit(b & 0xf));
        }
        if shortest && tag.is_int() {
            let trim = hex.iter().take_while(|&&c| c == b'0').count();
            let trim = trim.min(hex.len() - 1);
            hex.drain(..trim);
        }
    } else {
        for &b in data {
            hex.push(hex_digit(b >> 4));
            hex.push(hex_digit(b & 0xf));
        }
    }
    hex
}

/// Inverse of [`encode_hex`]: produce the store-endian raw bytes of a
/// value. Fixed-size values accept up to `2 * size` digits (missing ones
/// are leading zeros); others need an even number of digits.
pub fn decode_hex(endian: Endian, tag: TypeTag, hex: &[u8]) -> Option<Vec<u8>> {
    if hex.is_empty() {
        return None;
    }

    if tag.is_fixed() {
        let size = tag.size();
        if hex.len() > size * 2 {
            return None;
        }
        let value = parse_hex_u64(hex)?;
        let mut raw = vec![0u8; size];
        let le = value.to_le_bytes();
        match endian {
            Endian::Little => raw.copy_from_slice(&le[..size]),
            Endian::Big => {
                for i in 0..size {
                    raw[size - 1 - i] = le[i];
                }
            }
        }
        Some(raw)
    } else {
        if hex.len() % 2 != 0 {
            return None;
        }
        let mut raw = Vec::with_capacity(hex.len() / 2);
        for pair in hex.chunks(2) {
            raw.push((nibble(pair[0])? << 4) | nibble(pair[1])?);
        }
        Some(raw)
    }
}
