//! zkctl - rollup ledger query tool
//!
//! Read-only command-line access to the accounts, queue and proof chain
//! kept in a RocksDB ledger store.

use tracing_subscriber::EnvFilter;
use zkledger::cli;

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
