use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use marlin_applier::{Applier, LogCache, MemReplica};

/// Replication log applier: replays a master's copied log against a
/// replica database.
#[derive(Debug, Parser)]
#[command(name = "marlin-applier", version)]
struct Cli {
    /// Directory holding the copied active log and archives.
    #[arg(long)]
    log_path: PathBuf,
    /// Database name (the copied files are <name>_lgat, <name>_lgar*).
    #[arg(long)]
    db_name: String,
    /// Resident-memory cap in megabytes; exceeding it exits for an
    /// external restart. 0 disables the check.
    #[arg(long, default_value_t = 500)]
    max_mem_size: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cache = LogCache::open(&cli.log_path, &cli.db_name)
        .with_context(|| format!("opening copied log under {}", cli.log_path.display()))?;

    // TODO: swap MemReplica for the real client library connection once
    // the connector crate is wired into this workspace.
    let client = MemReplica::new();
    let max_mem = (cli.max_mem_size > 0).then_some(cli.max_mem_size * 1024);
    let applier = Applier::new(cache, client, &cli.db_name, max_mem)?;

    tokio::select! {
        out = applier.run() => {
            out.context("applier terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
        }
    }
    Ok(())
}
