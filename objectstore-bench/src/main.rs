//! Runs benchmarks against an object storage service and prints their results.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod cli;

fn main() -> anyhow::Result<()> {
    cli::execute()
}
