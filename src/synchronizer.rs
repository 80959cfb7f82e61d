//! Multi-party state replication.
//!
//! A [`Synchronizer`] knows the synchronizable stores of its process (by
//! schema hash) and any number of connections to peers. Peers exchange
//! four messages — Hello, Welcome, Update, Bye — over whatever protocol
//! stack each connection was built on. Message ids, keys and values travel
//! in the store's endianness; the opcode letter is lower case for
//! little-endian stores and upper case for big-endian ones.

use std::collections::BTreeMap;

use crate::journal::Seq;
use crate::protocol::ProtocolStack;
use crate::store::StoreHandle;
use crate::types::Endian;

pub type Id = u16;

const OP_HELLO: u8 = b'h';
const OP_WELCOME: u8 = b'w';
const OP_UPDATE: u8 = b'u';
const OP_BYE: u8 = b'b';

fn opcode(base: u8, endian: Endian) -> u8 {
    match endian {
        Endian::Little => base,
        Endian::Big => base.to_ascii_uppercase(),
    }
}

// An opcode byte maps back to its base letter plus the sender's claimed
// endianness.
fn decode_opcode(b: u8) -> Option<(u8, Endian)> {
    let endian = if b.is_ascii_lowercase() {
        Endian::Little
    } else {
        Endian::Big
    };
    let base = b.to_ascii_lowercase();
    matches!(base, OP_HELLO | OP_WELCOME | OP_UPDATE | OP_BYE).then_some((base, endian))
}

#[derive(Debug, Default, Clone, Copy)]
struct StoreState {
    /// Id the peer assigned; our updates carry it. 0 while unassigned.
    id_out: Id,
    /// Everything up to this seq has been sent over this connection.
    seq: Seq,
    /// We advertised this side as wanting the store from the peer.
    source: bool,
}

/// One peer link: a protocol stack plus per-store replication state.
pub struct SyncConnection {
    stack: ProtocolStack,
    /// Ids we allocated, keyed to the store hash they refer to.
    id_in: BTreeMap<Id, String>,
    stores: BTreeMap<String, StoreState>,
    next_id: Id,
}

impl SyncConnection {
    fn new(stack: ProtocolStack) -> Self {
        SyncConnection {
            stack,
            id_in: BTreeMap::new(),
            stores: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> Id {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.id_in.contains_key(&id) {
                return id;
            }
        }
    }

    fn id_for(&self, hash: &str) -> Option<Id> {
        self.id_in
            .iter()
            .find(|(_, h)| h.as_str() == hash)
            .map(|(&id, _)| id)
    }

    fn is_synchronizing(&self, hash: &str) -> bool {
        self.stores.contains_key(hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(usize);

/// The replication service: maps stores by hash, owns the connections.
#[derive(Default)]
pub struct Synchronizer {
    stores: BTreeMap<String, StoreHandle>,
    connections: Vec<Option<SyncConnection>>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronizable store. Ignored when the store carries no
    /// journal.
    pub fn map(&mut self, store: &StoreHandle) {
        let s = store.borrow();
        if !s.is_synchronizable() {
            return;
        }
        let hash = s.hash().to_string();
        drop(s);
        self.stores.insert(hash, store.clone());
    }

    /// Deregister a store, saying Bye for it on every connection.
    pub fn unmap(&mut self, store: &StoreHandle) {
        let hash = store.borrow().hash().to_string();
        self.stores.remove(&hash);
        for slot in &mut self.connections {
            if let Some(c) = slot {
                let had_store = c.stores.remove(&hash).is_some();
                if had_store || c.id_for(&hash).is_some() {
                    let ids: Vec<Id> = c
                        .id_in
                        .iter()
                        .filter(|(_, h)| h.as_str() == hash)
                        .map(|(&id, _)| id)
                        .collect();
                    for id in ids {
                        c.id_in.remove(&id);
                    }
                    let endian = store.borrow().endian();
                    let mut msg = vec![opcode(OP_BYE, endian)];
                    msg.extend_from_slice(hash.as_bytes());
                    msg.push(0);
                    c.stack.encode(&msg);
                }
            }
        }
    }

    pub fn store(&self, hash: &str) -> Option<&StoreHandle> {
        self.stores.get(hash)
    }

    /// Build a connection on top of the given protocol stack.
    pub fn connect(&mut self, stack: ProtocolStack) -> ConnectionId {
        tracing::debug!(connection = self.connections.len(), "sync connect");
        self.connections.push(Some(SyncConnection::new(stack)));
        ConnectionId(self.connections.len() - 1)
    }

    /// Drop a connection, telling the peer to forget everything. Returns
    /// the farewell frames for the transport to write out.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<Vec<u8>> {
        let Some(mut c) = self
            .connections
            .get_mut(conn.0)
            .and_then(Option::take)
        else {
            return Vec::new();
        };
        if !c.stores.is_empty() {
            let endian = self.conn_endian(&c);
            c.stack.encode(&[opcode(OP_BYE, endian)]);
        }
        tracing::debug!(connection = conn.0, "sync disconnect");
        c.stack.flush();
        c.stack.take_tx()
    }

    // Endianness for messages that are not tied to one store: all stores of
    // a synchronizer share a build, so take it from any mapped store.
    fn conn_endian(&self, c: &SyncConnection) -> Endian {
        c.stores
            .keys()
            .next()
            .and_then(|h| self.stores.get(h))
            .map(|s| s.borrow().endian())
            .unwrap_or_default()
    }

    /// Ask the peer on `conn` for the initial content and future updates
    /// of `store`.
    pub fn sync_from(&mut self, store: &StoreHandle, conn: ConnectionId) {
        let hash = store.borrow().hash().to_string();
        if !self.stores.contains_key(&hash) {
            return;
        }
        let Some(c) = self.connections.get_mut(conn.0).and_then(Option::as_mut) else {
            return;
        };
        if c.stores.contains_key(&hash) {
            // Already registered; the direction must not change.
            return;
        }
        c.stores.insert(
            hash.clone(),
            StoreState {
                source: true,
                ..Default::default()
            },
        );
        let id = c.alloc_id();
        c.id_in.insert(id, hash.clone());
        let endian = store.borrow().endian();
        let mut msg = vec![opcode(OP_HELLO, endian)];
        msg.extend_from_slice(hash.as_bytes());
        msg.push(0);
        push_id(&mut msg, id, endian);
        c.stack.encode(&msg);
    }

    /// Send pending updates of every store over every connection.
    pub fn process(&mut self) {
        let hashes: Vec<String> = self.stores.keys().cloned().collect();
        for hash in hashes {
            self.process_hash(&hash);
        }
    }

    /// Send pending updates of one store over every connection.
    pub fn process_store(&mut self, store: &StoreHandle) {
        let hash = store.borrow().hash().to_string();
        self.process_hash(&hash);
    }

    fn process_hash(&mut self, hash: &str) {
        let Some(store) = self.stores.get(hash).cloned() else {
            return;
        };
        for slot in &mut self.connections {
            if let Some(c) = slot {
                Self::process_on(c, hash, &store);
            }
        }
    }

    /// Send pending updates of one store over one connection. Returns the
    /// seq the connection is now synchronized to, or 0 when nothing was
    /// sent.
    pub fn process_conn(&mut self, conn: ConnectionId, store: &StoreHandle) -> Seq {
        let hash = store.borrow().hash().to_string();
        if !self.stores.contains_key(&hash) {
            return 0;
        }
        match self.connections.get_mut(conn.0).and_then(Option::as_mut) {
            Some(c) => Self::process_on(c, &hash, store),
            None => 0,
        }
    }

    fn process_on(c: &mut SyncConnection, hash: &str, store: &StoreHandle) -> Seq {
        let Some(state) = c.stores.get_mut(hash) else {
            return 0;
        };
        if state.id_out == 0 {
            // No Welcome yet; nothing to tag updates with.
            return 0;
        }
        let mut s = store.borrow_mut();
        let since = state.seq;
        let changed = match s.journal() {
            Some(j) => j.has_changed(since),
            None => false,
        };
        if !changed {
            return 0;
        }
        let endian = s.endian();
        let mut msg = vec![opcode(OP_UPDATE, endian)];
        push_id(&mut msg, state.id_out, endian);
        let seq = s.collect_updates(&mut msg, since);
        state.seq = seq;
        drop(s);
        c.stack.encode(&msg);
        seq
    }

    /// Feed transport bytes into a connection's stack and handle every
    /// sync message that pops out.
    pub fn feed(&mut self, conn: ConnectionId, bytes: &[u8]) {
        let Some(slot) = self.connections.get_mut(conn.0) else {
            return;
        };
        let Some(mut c) = slot.take() else {
            return;
        };
        let frames = c.stack.decode(bytes);
        for frame in frames {
            self.handle_frame(&mut c, &frame);
        }
        self.connections[conn.0] = Some(c);
    }

    /// Collect a connection's pending transmit frames.
    pub fn take_tx(&mut self, conn: ConnectionId) -> Vec<Vec<u8>> {
        match self.connections.get_mut(conn.0).and_then(Option::as_mut) {
            Some(c) => {
                c.stack.flush();
                c.stack.take_tx()
            }
            None => Vec::new(),
        }
    }

    fn handle_frame(&mut self, c: &mut SyncConnection, frame: &[u8]) {
        let Some((&op, rest)) = frame.split_first() else {
            return;
        };
        let Some((base, claimed_endian)) = decode_opcode(op) else {
            return;
        };

        match base {
            OP_HELLO => self.on_hello(c, rest, claimed_endian),
            OP_WELCOME => self.on_welcome(c, rest, claimed_endian),
            OP_UPDATE => self.on_update(c, rest, claimed_endian),
            OP_BYE => self.on_bye(c, rest, claimed_endian),
            _ => {}
        }
    }

    fn on_hello(&mut self, c: &mut SyncConnection, rest: &[u8], claimed: Endian) {
        let Some((hash, rest)) = split_hash(rest) else {
            return;
        };
        let Some(id) = read_id(rest, claimed) else {
            return;
        };
        if id == 0 {
            return;
        }
        let Some(store) = self.stores.get(hash).cloned() else {
            // Unknown store; drop it immediately.
            bye_hash(c, hash, claimed);
            return;
        };
        let endian = store.borrow().endian();
        if endian != claimed {
            // Endianness disagreement; the schema hash should have differed
            // before this point. Reject.
            bye_hash(c, hash, endian);
            return;
        }

        tracing::debug!(hash, id, "sync hello");

        // A previous sync to this store is replaced.
        let stale: Vec<Id> = c
            .id_in
            .iter()
            .filter(|(_, h)| h.as_str() == hash)
            .map(|(&i, _)| i)
            .collect();
        for i in stale {
            c.id_in.remove(&i);
        }

        let our_id = c.alloc_id();
        c.id_in.insert(our_id, hash.to_string());

        let mut msg = vec![opcode(OP_WELCOME, endian)];
        push_id(&mut msg, id, endian);
        push_id(&mut msg, our_id, endian);
        let seq = store.borrow_mut().encode_sync_buffer(&mut msg);

        c.stores.insert(
            hash.to_string(),
            StoreState {
                id_out: id,
                seq,
                source: false,
            },
        );
        c.stack.encode(&msg);
    }

    fn on_welcome(&mut self, c: &mut SyncConnection, rest: &[u8], claimed: Endian) {
        let Some(hello_id) = read_id(rest, claimed) else {
            return;
        };
        let rest = &rest[2..];
        let Some(welcome_id) = read_id(rest, claimed) else {
            return;
        };
        let buffer = &rest[2..];

        let Some(hash) = c.id_in.get(&hello_id).cloned() else {
            bye_id(c, hello_id, claimed);
            return;
        };
        if welcome_id == 0 {
            bye_id(c, hello_id, claimed);
            return;
        }
        let Some(store) = self.stores.get(&hash).cloned() else {
            bye_id(c, hello_id, claimed);
            return;
        };
        let seq = store.borrow_mut().decode_sync_buffer(buffer);
        if seq == 0 {
            bye_id(c, hello_id, claimed);
            return;
        }
        let Some(state) = c.stores.get_mut(&hash) else {
            bye_id(c, hello_id, claimed);
            return;
        };
        if !state.source {
            // Wrong direction.
            bye_id(c, hello_id, claimed);
            return;
        }
        tracing::debug!(hash, hello_id, welcome_id, "sync welcome");
        state.seq = seq;
        state.id_out = welcome_id;
    }

    fn on_update(&mut self, c: &mut SyncConnection, rest: &[u8], claimed: Endian) {
        let Some(id) = read_id(rest, claimed) else {
            return;
        };
        if id == 0 {
            return;
        }
        let data = &rest[2..];

        let Some(hash) = c.id_in.get(&id).cloned() else {
            bye_id(c, id, claimed);
            return;
        };
        let Some(store) = self.stores.get(&hash).cloned() else {
            bye_id(c, id, claimed);
            return;
        };

        // Flush our own pending changes first, everywhere, so the incoming
        // state cannot mask them.
        Self::process_on(c, &hash, &store);
        for slot in &mut self.connections {
            if let Some(other) = slot {
                Self::process_on(other, &hash, &store);
            }
        }

        // Record the decoded changes in our journal too when this store is
        // also replicated to someone else, so the delta propagates.
        let record_all = self
            .connections
            .iter()
            .flatten()
            .any(|other| other.is_synchronizing(&hash));

        let seq = store.borrow_mut().apply_updates(data, record_all);
        if seq == 0 {
            bye_id(c, id, claimed);
            return;
        }
        if let Some(state) = c.stores.get_mut(&hash) {
            state.seq = seq;
        }
    }

    fn on_bye(&mut self, c: &mut SyncConnection, rest: &[u8], claimed: Endian) {
        if rest.is_empty() {
            // The peer restarts from scratch: forget what it fed us,
            // re-request what we source from it.
            tracing::debug!("sync bye (all)");
            let non_sources: Vec<String> = c
                .stores
                .iter()
                .filter(|(_, s)| !s.source)
                .map(|(h, _)| h.clone())
                .collect();
            for hash in non_sources {
                c.stores.remove(&hash);
                let stale: Vec<Id> = c
                    .id_in
                    .iter()
                    .filter(|(_, h)| h.as_str() == hash)
                    .map(|(&i, _)| i)
                    .collect();
                for i in stale {
                    c.id_in.remove(&i);
                }
            }
            let sources: Vec<String> = c
                .stores
                .iter()
                .filter(|(_, s)| s.source)
                .map(|(h, _)| h.clone())
                .collect();
            for hash in sources {
                self.hello_again(c, &hash);
            }
        } else if rest.len() == 2 {
            let Some(id) = read_id(rest, claimed) else {
                return;
            };
            let Some(hash) = c.id_in.get(&id).cloned() else {
                return;
            };
            let state = c.stores.get(&hash).copied().unwrap_or_default();
            if state.source && state.id_out != 0 {
                // We still need it.
                self.hello_again(c, &hash);
            } else {
                // Release the outbound entry.
                c.stores.remove(&hash);
                c.id_in.remove(&id);
            }
        } else {
            let Some((hash, _)) = split_hash(rest) else {
                return;
            };
            let Some(state) = c.stores.get(hash).copied() else {
                return;
            };
            if state.source && state.id_out != 0 {
                let hash = hash.to_string();
                self.hello_again(c, &hash);
            } else {
                let stale: Vec<Id> = c
                    .id_in
                    .iter()
                    .filter(|(_, h)| h.as_str() == hash)
                    .map(|(&i, _)| i)
                    .collect();
                for i in stale {
                    c.id_in.remove(&i);
                }
                c.stores.remove(hash);
            }
        }
    }

    fn hello_again(&mut self, c: &mut SyncConnection, hash: &str) {
        let Some(state) = c.stores.get_mut(hash) else {
            return;
        };
        state.id_out = 0;
        let Some(id) = c.id_for(hash) else {
            return;
        };
        let endian = self
            .stores
            .get(hash)
            .map(|s| s.borrow().endian())
            .unwrap_or_default();
        tracing::debug!(hash, id, "sync hello (again)");
        let mut msg = vec![opcode(OP_HELLO, endian)];
        msg.extend_from_slice(hash.as_bytes());
        msg.push(0);
        push_id(&mut msg, id, endian);
        c.stack.encode(&msg);
    }
}

fn push_id(msg: &mut Vec<u8>, id: Id, endian: Endian) {
    let mut raw = [0u8; 2];
    endian.write_u16(id, &mut raw);
    msg.extend_from_slice(&raw);
}

fn read_id(data: &[u8], endian: Endian) -> Option<Id> {
    if data.len() < 2 {
        return None;
    }
    Some(endian.read_u16(data))
}

fn split_hash(data: &[u8]) -> Option<(&str, &[u8])> {
    let nul = data.iter().position(|&b| b == 0)?;
    let hash = std::str::from_utf8(&data[..nul]).ok()?;
    Some((hash, &data[nul + 1..]))
}

fn bye_hash(c: &mut SyncConnection, hash: &str, endian: Endian) {
    let mut msg = vec![opcode(OP_BYE, endian)];
    msg.extend_from_slice(hash.as_bytes());
    msg.push(0);
    c.stack.encode(&msg);
}

fn bye_id(c: &mut SyncConnection, id: Id, endian: Endian) {
    // Drop our local registration of the id as well.
    if let Some(hash) = c.id_in.get(&id).cloned() {
        c.stores.remove(&hash);
    }
    c.id_in.remove(&id);
    let mut msg = vec![opcode(OP_BYE, endian)];
    push_id(&mut msg, id, endian);
    c.stack.encode(&msg);
}
