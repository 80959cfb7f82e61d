use anyhow::Result;

use syncstore::directory::{DirectoryBuilder, Object};
use syncstore::types::{Endian, TypeTag};
use syncstore::{BufferStore, StoreDef};

pub const DEMO_HASH: &str = "f61d3c1cdeadbeef";

/// A small store covering every object kind, standing in for
/// compiler-generated output.
pub fn demo_store() -> Result<BufferStore> {
    let (short_dir, long_dir) = DirectoryBuilder::new()
        .add(
            "/default int8",
            Object::Variable {
                tag: TypeTag::INT8,
                offset: 0,
                len: 1,
            },
        )
        .add(
            "/default uint8",
            Object::Variable {
                tag: TypeTag::UINT8,
                offset: 1,
                len: 1,
            },
        )
        .add(
            "/default int16",
            Object::Variable {
                tag: TypeTag::INT16,
                offset: 2,
                len: 2,
            },
        )
        .add(
            "/default uint32",
            Object::Variable {
                tag: TypeTag::UINT32,
                offset: 4,
                len: 4,
            },
        )
        .add(
            "/default double",
            Object::Variable {
                tag: TypeTag::DOUBLE,
                offset: 8,
                len: 8,
            },
        )
        .add(
            "/flag",
            Object::Variable {
                tag: TypeTag::BOOL,
                offset: 16,
                len: 1,
            },
        )
        .add(
            "/blob b",
            Object::Variable {
                tag: TypeTag::BLOB,
                offset: 17,
                len: 4,
            },
        )
        .add(
            "/name",
            Object::Variable {
                tag: TypeTag::STRING,
                offset: 21,
                len: 8,
            },
        )
        .add(
            "/time (s)",
            Object::Function {
                tag: TypeTag::UINT32,
                id: 1,
                len: 4,
            },
        )
        .build()?;

    let mut store = BufferStore::new(StoreDef {
        name: "/demo".to_string(),
        hash: DEMO_HASH.to_string(),
        endian: Endian::Little,
        buffer: vec![0; 32],
        short_dir,
        long_dir,
        synchronizable: true,
    })?;

    let mut ticks: u32 = 0;
    store.set_functions(Box::new(move |set, buffer, id| match id {
        1 => {
            if !set {
                ticks += 1;
                buffer[..4].copy_from_slice(&ticks.to_le_bytes());
            }
            4
        }
        _ => 0,
    }));

    Ok(store)
}
