use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sheet_sync::tracker::ChangeTracker;
use sheet_sync::{
    BidirectionalSync, HttpRpcClient, LocalStore, RegistryResolver, RemoteChange, SyncConfig,
};

#[derive(Parser)]
#[command(name = "sheet-sync", version, about = "Sync a local DuckDB store with a remote spreadsheet")]
struct Cli {
    /// Config file (defaults to the per-user config path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push local changes, then pull remote ones
    Sync,
    /// Pull pending remote changes
    Pull,
    /// Push captured local changes
    Push,
    /// Show sync status
    Status,
    /// Start capturing local edits to a table
    Track { table: String },
    /// Apply remote changes read from a JSON file
    Ingest { file: PathBuf },
    /// Apply the configured mode and run until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::discover(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(open_store(&config)?);

    match cli.command {
        Command::Status => print_json(&store.sync_status()?),
        Command::Track { table } => {
            let tracked = ChangeTracker::new(store).install_tracking(&table)?;
            println!("{} columns of {} are tracked", tracked, table);
            Ok(())
        }
        Command::Sync => print_json(&engine(&config, store)?.sync_bidirectional().await),
        Command::Pull => print_json(&engine(&config, store)?.pull().sync().await),
        Command::Push => print_json(&engine(&config, store)?.pusher().push_to_sheet().await),
        Command::Ingest { file } => {
            let contents = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let changes: Vec<RemoteChange> = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse changes in {}", file.display()))?;
            let result = engine(&config, store)?.receive_realtime_changes(changes).await;
            print_json(&result)
        }
        Command::Run => run(&config, store).await,
    }
}

fn open_store(config: &SyncConfig) -> Result<LocalStore> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    LocalStore::open(path)
}

fn engine(config: &SyncConfig, store: Arc<LocalStore>) -> Result<Arc<BidirectionalSync>> {
    config.require_remote()?;
    store.set_sync_target(
        config.remote.target_url.as_deref(),
        Some(config.remote.document_id.as_str()),
    )?;

    let rpc = Arc::new(HttpRpcClient::from_config(&config.remote)?);
    let resolver = Arc::new(RegistryResolver::new(store.clone()));
    let sync = BidirectionalSync::with_settings(store, rpc, resolver, &config.sync);

    for table in &config.sync.tables {
        sync.setup_change_tracking(table)
            .with_context(|| format!("Failed to track {}", table))?;
    }
    Ok(Arc::new(sync))
}

async fn run(config: &SyncConfig, store: Arc<LocalStore>) -> Result<()> {
    let sync = engine(config, store)?;
    sync.set_mode(config.sync.mode, config.sync.interval()).await?;
    info!("Running in {} mode, press Ctrl-C to stop", sync.mode());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }

    sync.stop();
    info!("Stopped");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
