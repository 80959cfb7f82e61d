mod demo;
mod debug_session;
use debug_session::debug_session;
mod list_objects;
use list_objects::list_objects;
mod sync_demo;
use sync_demo::sync_demo;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Poke at syncstore stores without a target device
#[derive(Clone, Debug, Parser)]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// List every object of the built-in demo store
    List,
    /// Run a debugger session against the demo store, one request per
    /// stdin line
    Debug,
    /// Replicate the demo store between two in-process synchronizers
    SyncDemo,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.operation {
        Operation::List => list_objects(),
        Operation::Debug => debug_session(),
        Operation::SyncDemo => sync_demo(),
    }
}
