//! satindex CLI: inspect and audit indexer state.
//!
//! Usage:
//! ```bash
//! satindex status --db ./satindex.db
//! satindex check  --db ./satindex.db
//! satindex info   [--config indexer.json]
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use satindex_bitcoin::IndexerSet;
use satindex_core::config::IndexerConfig;
use satindex_core::snapshot::SubIndexer;
use satindex_core::store::PersistentStore;
use satindex_core::sync_state::{ensure_db_version, SyncState};
use satindex_storage::sqlite::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "status" => cmd_status(&flag(&args, "--db")?).await,
        "check" => cmd_check(&flag(&args, "--db")?).await,
        "info" => cmd_info(optional_flag(&args, "--config")),
        "version" | "--version" | "-V" => {
            println!("satindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("satindex {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe sat-range and ordinals indexer\n");
    println!("USAGE:");
    println!("    satindex <COMMAND> [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    status   --db <PATH>          Show the persisted sync state");
    println!("    check    --db <PATH>          Run every consistency check");
    println!("    info     [--config <FILE>]    Show the effective configuration");
    println!("    version                       Print version");
    println!("    help                          Print this help");
}

fn optional_flag(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn flag(args: &[String], name: &str) -> Result<String> {
    match optional_flag(args, name) {
        Some(v) => Ok(v),
        None => bail!("missing required option {name}"),
    }
}

async fn open_store(path: &str) -> Result<Arc<dyn PersistentStore>> {
    let store = SqliteStore::open(path)
        .await
        .with_context(|| format!("opening {path}"))?;
    ensure_db_version(&store).await?;
    Ok(Arc::new(store))
}

async fn cmd_status(path: &str) -> Result<()> {
    let store = open_store(path).await?;
    let state = SyncState::load(store.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn cmd_check(path: &str) -> Result<()> {
    let store = open_store(path).await?;
    let set = IndexerSet::load(store).await?;
    let height = set.sync_state().sync_height;
    if !set.check_consistency().await? {
        bail!("consistency check failed at height {height:?}");
    }
    println!("consistent at height {height:?}");
    Ok(())
}

fn cmd_info(config_path: Option<String>) -> Result<()> {
    let config = match &config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str::<IndexerConfig>(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => IndexerConfig::default(),
    };
    println!("satindex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Chain: {}", config.chain);
    println!("  Block history (H): {} blocks", config.block_history);
    println!("  Check period: every {} blocks", config.check_period);
    println!("  Prefetch capacity: {} blocks", config.prefetch_capacity);
    println!("  Poll interval: {} ms", config.poll_interval_ms);
    println!("  Snapshot interval: every {} blocks", config.snapshot_interval);
    match config.to_height {
        Some(h) => println!("  Stop height: {h}"),
        None => println!("  Stop height: none (follow tip)"),
    }
    println!(
        "  Retry: {} attempts, {} ms linear backoff",
        config.retry.max_attempts, config.retry.base_delay_ms
    );
    println!("  Storage backends: memory, SQLite");
    println!("  Sub-indexers: ledger, rarity, nft, ticker, names");
    Ok(())
}
