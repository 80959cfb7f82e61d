use std::io::{BufRead, Write};

use anyhow::Result;

use syncstore::protocol::BufferResponder;
use syncstore::{Debugger, DebuggerConfig};

use crate::demo::demo_store;

/// Feed debugger requests from stdin, one per line, and print responses.
pub fn debug_session() -> Result<()> {
    let mut debugger = Debugger::new(DebuggerConfig::default());
    debugger.set_identification("syncstore-tools");
    debugger.set_versions("demo");
    debugger.map(demo_store()?.into_handle(), None);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let mut response = BufferResponder::default();
        debugger.process(line.as_bytes(), &mut response);
        stdout.write_all(&response.data)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }
    Ok(())
}
