//! The store runtime: a typed, schema-driven byte buffer with named
//! accessors and a hook pipeline.
//!
//! A [`BufferStore`] is handed its buffer, directory blobs and schema hash
//! as opaque inputs (normally emitted by the schema compiler). All mutation
//! routes through [`BufferStore::set`] so the hook pipeline always runs; a
//! synchronizable store feeds `exit_x(changed = true)` into its journal.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use anyhow::{ensure, Result};

use crate::directory;
use crate::journal::{Key, StoreJournal};
use crate::types::{saturated_cast, Endian, TypeTag, Value};

/// Pre/post access hooks of a store.
///
/// `entry_x`/`exit_x` bracket exclusive (write) access, `entry_ro`/`exit_ro`
/// bracket read-only access. All default to no-ops.
pub trait Hooks {
    fn entry_ro(&mut self, _tag: TypeTag, _offset: u32, _len: usize) {}
    fn exit_ro(&mut self, _tag: TypeTag, _offset: u32, _len: usize) {}
    fn entry_x(&mut self, _tag: TypeTag, _offset: u32, _len: usize) {}
    fn exit_x(&mut self, _tag: TypeTag, _offset: u32, _len: usize, _changed: bool) {}
    /// A remote update was applied to the given object.
    fn changed(&mut self, _tag: TypeTag, _offset: u32, _len: usize) {}
}

struct NoHooks;
impl Hooks for NoHooks {}

/// Erased reference to a variable or function inside a store.
///
/// Trivially copyable; access goes through the owning store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    tag: TypeTag,
    a: u32, // buffer offset, or function id
    len: u32,
}

impl Variant {
    pub fn invalid() -> Self {
        Variant {
            tag: TypeTag::INVALID,
            a: 0,
            len: 0,
        }
    }

    pub(crate) fn variable(tag: TypeTag, offset: u32, len: u32) -> Self {
        Variant { tag, a: offset, len }
    }

    pub(crate) fn function(tag: TypeTag, id: u32, len: u32) -> Self {
        Variant { tag, a: id, len }
    }

    pub fn valid(&self) -> bool {
        self.tag.is_valid()
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn is_function(&self) -> bool {
        self.tag.is_function()
    }

    pub fn is_variable(&self) -> bool {
        self.valid() && !self.is_function()
    }

    /// Buffer offset of a variable.
    pub fn offset(&self) -> u32 {
        debug_assert!(self.is_variable());
        self.a
    }

    /// Identifier of a function.
    pub fn id(&self) -> u32 {
        debug_assert!(self.is_function());
        self.a
    }

    /// Size in bytes: the type's size for fixed types, the directory length
    /// otherwise.
    pub fn size(&self) -> usize {
        if self.tag.is_fixed() {
            self.tag.size()
        } else {
            self.len as usize
        }
    }
}

/// Typed handle to a fixed-size variable.
pub struct Variable<T> {
    offset: u32,
    _type: PhantomData<T>,
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Variable<T> {}

impl<T: Value> Variable<T> {
    pub fn get(self, store: &mut BufferStore) -> T {
        let mut raw = [0u8; 8];
        let n = T::SIZE;
        store.get(
            Variant::variable(T::TAG, self.offset, n as u32),
            &mut raw[..n],
        );
        T::load(store.endian(), &raw[..n])
    }

    /// Read and convert, clamping to the target range.
    pub fn get_as<U>(self, store: &mut BufferStore) -> U
    where
        T: num_traits::ToPrimitive,
        U: num_traits::NumCast + num_traits::Bounded,
    {
        saturated_cast(self.get(store))
    }

    pub fn set(self, store: &mut BufferStore, v: T) {
        let mut raw = [0u8; 8];
        let n = T::SIZE;
        v.store(store.endian(), &mut raw[..n]);
        store.set(Variant::variable(T::TAG, self.offset, n as u32), &raw[..n]);
    }

    pub fn key(self) -> Key {
        self.offset
    }

    pub fn variant(self) -> Variant {
        Variant::variable(T::TAG, self.offset, T::SIZE as u32)
    }
}

/// Typed handle to a function object.
pub struct Function<T> {
    id: u32,
    _type: PhantomData<T>,
}

impl<T> Clone for Function<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Function<T> {}

impl<T: Value> Function<T> {
    pub fn get(self, store: &mut BufferStore) -> T {
        let mut raw = [0u8; 8];
        let n = T::SIZE;
        store.call(false, &mut raw[..n], self.id);
        T::load(store.endian(), &raw[..n])
    }

    pub fn set(self, store: &mut BufferStore, v: T) {
        let mut raw = [0u8; 8];
        let n = T::SIZE;
        v.store(store.endian(), &mut raw[..n]);
        store.call(true, &mut raw[..n], self.id);
    }

    pub fn id(self) -> u32 {
        self.id
    }
}

/// The dispatch target of function objects: `(set, buffer, id) ->
/// bytes_transferred`. On `set == false` the callback fills `buffer`, on
/// `set == true` it consumes it.
pub type FunctionCallback = Box<dyn FnMut(bool, &mut [u8], u32) -> usize>;

/// Opaque inputs of a store, as emitted by the schema compiler.
pub struct StoreDef {
    /// Debugger mapping name, `/`-prefixed, no further `/`.
    pub name: String,
    /// Schema hash identifying the layout across processes.
    pub hash: String,
    pub endian: Endian,
    pub buffer: Vec<u8>,
    pub short_dir: Vec<u8>,
    pub long_dir: Vec<u8>,
    /// Record changes in a journal so the store can be synchronized.
    pub synchronizable: bool,
}

/// A store instance: buffer, directories, function dispatch, hooks and
/// (when synchronizable) the change journal.
pub struct BufferStore {
    name: String,
    hash: String,
    endian: Endian,
    buffer: Vec<u8>,
    short_dir: Vec<u8>,
    long_dir: Vec<u8>,
    functions: Option<FunctionCallback>,
    hooks: Box<dyn Hooks>,
    journal: Option<StoreJournal>,
}

/// Shared single-threaded handle, as mapped into debuggers and
/// synchronizers.
pub type StoreHandle = Rc<RefCell<BufferStore>>;

impl BufferStore {
    pub fn new(def: StoreDef) -> Result<Self> {
        ensure!(
            def.name.starts_with('/') && !def.name[1..].contains('/'),
            "Store name must be a single /-prefixed component"
        );
        ensure!(!def.hash.is_empty(), "Store without a schema hash");
        ensure!(
            def.hash.len() > 2,
            "Schema hash must be longer than a sync id"
        );
        let journal = def
            .synchronizable
            .then(|| StoreJournal::new(&def.hash, def.buffer.len(), def.endian));
        Ok(BufferStore {
            name: def.name,
            hash: def.hash,
            endian: def.endian,
            buffer: def.buffer,
            short_dir: def.short_dir,
            long_dir: def.long_dir,
            functions: None,
            hooks: Box::new(NoHooks),
            journal,
        })
    }

    pub fn into_handle(self) -> StoreHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn set_functions(&mut self, cb: FunctionCallback) {
        self.functions = Some(cb);
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn Hooks>) {
        self.hooks = hooks;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn journal(&mut self) -> Option<&mut StoreJournal> {
        self.journal.as_mut()
    }

    pub fn is_synchronizable(&self) -> bool {
        self.journal.is_some()
    }

    /// Resolve an object name (possibly abbreviated) to a [`Variant`].
    pub fn find(&self, name: &[u8]) -> Variant {
        directory::find(self.buffer.len(), &self.short_dir, name, name.len())
    }

    /// Enumerate all objects with their full names.
    pub fn list(&self, f: &mut dyn FnMut(&str, Variant)) -> Result<()> {
        directory::list(self.buffer.len(), &self.long_dir, f)
    }

    /// Typed accessor; `None` when the name does not resolve to a variable
    /// of type `T`.
    pub fn variable<T: Value>(&self, name: &str) -> Option<Variable<T>> {
        let v = self.find(name.as_bytes());
        (v.is_variable() && v.tag() == T::TAG).then(|| Variable {
            offset: v.offset(),
            _type: PhantomData,
        })
    }

    /// Typed function accessor.
    pub fn function<T: Value>(&self, name: &str) -> Option<Function<T>> {
        let v = self.find(name.as_bytes());
        (v.valid() && v.is_function() && v.tag().value_type() == T::TAG).then(|| Function {
            id: v.id(),
            _type: PhantomData,
        })
    }

    /// Read an object through the hook pipeline.
    ///
    /// Returns the number of bytes written into `dst`.
    pub fn get(&mut self, v: Variant, dst: &mut [u8]) -> usize {
        if !v.valid() {
            return 0;
        }
        if v.is_function() {
            return self.call(false, dst, v.id());
        }
        let len = self.clamped_len(v, dst.len());
        let off = v.offset() as usize;
        self.hooks.entry_ro(v.tag(), v.offset(), len);
        dst[..len].copy_from_slice(&self.buffer[off..off + len]);
        self.hooks.exit_ro(v.tag(), v.offset(), len);
        len
    }

    /// Write an object through the hook pipeline.
    ///
    /// Returns the number of bytes consumed from `src`. A changed write to a
    /// synchronizable store is recorded in the journal.
    pub fn set(&mut self, v: Variant, src: &[u8]) -> usize {
        if !v.valid() {
            return 0;
        }
        if v.is_function() {
            let mut tmp = src.to_vec();
            return self.call(true, &mut tmp, v.id());
        }
        let len = self.clamped_len(v, src.len());
        let off = v.offset() as usize;
        self.hooks.entry_x(v.tag(), v.offset(), len);
        let changed = self.buffer[off..off + len] != src[..len];
        if changed {
            self.buffer[off..off + len].copy_from_slice(&src[..len]);
            if let Some(journal) = &mut self.journal {
                journal.changed(v.offset(), len, true);
            }
        }
        self.hooks.exit_x(v.tag(), v.offset(), len, changed);
        len
    }

    fn clamped_len(&self, v: Variant, requested: usize) -> usize {
        let size = v.size();
        if v.tag().is_fixed() {
            size
        } else {
            size.min(requested)
        }
    }

    pub(crate) fn call(&mut self, set: bool, buffer: &mut [u8], id: u32) -> usize {
        match &mut self.functions {
            Some(cb) => cb(set, buffer, id),
            None => 0,
        }
    }

    /// The synchronization key of a variable: its buffer offset.
    pub fn key_of(&self, v: Variant) -> Option<Key> {
        v.is_variable().then(|| v.offset())
    }

    // Wire-facing operations, delegating to the journal with buffer access.

    /// Encode the full buffer (Welcome payload), bracketed by the RO hooks.
    pub(crate) fn encode_sync_buffer(&mut self, out: &mut Vec<u8>) -> u64 {
        let journal = self.journal.as_mut().expect("not synchronizable");
        self.hooks.entry_ro(TypeTag::INVALID, 0, self.buffer.len());
        out.extend_from_slice(&self.buffer);
        self.hooks.exit_ro(TypeTag::INVALID, 0, self.buffer.len());
        journal.bump_seq(false)
    }

    /// Apply a full-buffer snapshot. Returns 0 on failure.
    pub(crate) fn decode_sync_buffer(&mut self, data: &[u8]) -> u64 {
        let journal = self.journal.as_mut().expect("not synchronizable");
        if data.len() < self.buffer.len() {
            return 0;
        }
        let n = self.buffer.len();
        self.buffer.copy_from_slice(&data[..n]);
        self.hooks.changed(TypeTag::INVALID, 0, n);
        journal.rebase_all();
        journal.bump_seq(false)
    }

    /// Append the wire records of everything changed since `since` and
    /// return the seq to pass next time.
    pub fn collect_updates(&mut self, out: &mut Vec<u8>, since: u64) -> u64 {
        let journal = self.journal.as_mut().expect("not synchronizable");
        journal.encode_updates(&self.buffer, out, since);
        journal.bump_seq(false)
    }

    /// Apply an update frame. Returns the new seq, or 0 when nothing usable
    /// was decoded; the store keeps any updates applied before the error.
    pub fn apply_updates(&mut self, data: &[u8], record_all: bool) -> u64 {
        let journal = self.journal.as_mut().expect("not synchronizable");
        let mut changed = Vec::new();
        let seq = journal.decode_updates(&mut self.buffer, data, record_all, &mut changed);
        for (key, len) in changed {
            self.hooks.changed(TypeTag::INVALID, key, len as usize);
        }
        seq
    }
}

impl std::fmt::Debug for BufferStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStore")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("endian", &self.endian)
            .field("buffer_size", &self.buffer.len())
            .field("synchronizable", &self.journal.is_some())
            .finish()
    }
}
