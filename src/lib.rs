#![deny(unsafe_code)]
//! Distributed, debuggable, embedded data stores.
//!
//! The crate provides the runtime shared by all generated stores: a typed
//! byte-buffer [`store`] with directory lookup and a hook pipeline, a
//! per-store change [`journal`], a [`debugger`] speaking an ASCII
//! request/response protocol, a library of stackable byte-stream
//! [`protocol`] layers (framing, escaping, CRC, segmentation, ARQ), a
//! multi-party [`synchronizer`] built on the journals, and a [`poller`]
//! abstraction over heterogeneous waitable resources.
//!
//! The schema compiler that emits buffers, directory blobs and hashes is a
//! separate tool; everything here treats those as opaque inputs (see
//! [`store::StoreDef`]), and [`directory::DirectoryBuilder`] can assemble
//! directories by hand.

pub mod debugger;
pub mod directory;
pub mod fifo;
pub mod journal;
pub mod poller;
pub mod protocol;
pub mod scratchpad;
pub mod store;
pub mod synchronizer;
pub mod types;


pub use debugger::{Debugger, DebuggerConfig};
pub use journal::{Key, Seq, StoreJournal};
pub use protocol::{Layer, LayerIo, ProtocolStack, Responder};
pub use store::{BufferStore, Function, StoreDef, StoreHandle, Variable, Variant};
pub use synchronizer::{ConnectionId, Synchronizer};
pub use types::{Endian, TypeTag};
