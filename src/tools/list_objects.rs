use anyhow::Result;

use crate::demo::demo_store;

pub fn list_objects() -> Result<()> {
    let store = demo_store()?;
    println!("store {} hash {}", store.name(), store.hash());
    store.list(&mut |name, v| {
        let kind = if v.is_function() { "fn " } else { "var" };
        println!("{kind} {:02x} {:4} {}", v.tag().0, v.size(), name);
    })?;
    Ok(())
}
