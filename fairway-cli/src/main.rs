//! fairway: operator tool for a Fairway replica.
//!
//! # Usage
//!
//! ```bash
//! # Pull every configured collection from the remote store
//! fairway restore
//!
//! # Force a push of one collection
//! fairway push trips
//!
//! # Local sizes, remote versions and sync state
//! fairway status
//!
//! # Print a collection, or one record of it
//! fairway show users alice
//!
//! # Run a replica and log changes until Ctrl-C
//! fairway --config fairway.json watch
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fairway_core::{
    FairwayConfig, PushOutcome, Replica, RestoreOutcome, RestoreReport, SyncRequestOutcome,
};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "fairway")]
#[command(author = "Fairway Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Fairway document store replication tool")]
struct Cli {
    /// Configuration file (defaults apply if it does not exist)
    #[arg(short, long, global = true, default_value = "fairway.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Overwrite local collections with their remote copies
    Restore {
        /// Collection to restore (repeatable; default: all configured)
        #[arg(short = 'C', long = "collection")]
        collections: Vec<String>,
    },

    /// Push one collection now, ignoring the rate limit
    Push {
        collection: String,
    },

    /// Show local sizes, remote versions and sync state
    Status,

    /// Pretty-print a collection or one of its records
    Show {
        collection: String,
        /// Record id
        id: Option<String>,
    },

    /// Run a replica: restore, drain the retry queue, log changes
    Watch,
}

fn init_logging(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("fairway=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fairway=info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn load_config(path: &Path) -> Result<FairwayConfig> {
    let mut config = FairwayConfig::load(path)?;
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = load_config(&cli.config)?;
    let replica = Replica::from_config(config)?;

    match cli.command {
        Commands::Restore { collections } => cmd_restore(&replica, collections).await,
        Commands::Push { collection } => cmd_push(&replica, &collection).await,
        Commands::Status => cmd_status(&replica).await,
        Commands::Show { collection, id } => cmd_show(&replica, &collection, id.as_deref()).await,
        Commands::Watch => cmd_watch(&replica).await,
    }
}

async fn cmd_restore(replica: &Replica, collections: Vec<String>) -> Result<()> {
    let collections = if collections.is_empty() {
        replica.config().collections.clone()
    } else {
        collections
    };
    println!("Restoring from {}...", replica.client().remote().describe());

    let report = replica
        .restorer()
        .restore_all(replica.store(), &collections)
        .await;
    print_report(&report);

    if report.unavailable() > 0 {
        return Err(anyhow!(
            "{} collection(s) could not be restored",
            report.unavailable()
        ));
    }
    Ok(())
}

fn print_report(report: &RestoreReport) {
    for (collection, outcome) in &report.outcomes {
        println!("  {:<16} {}", collection, describe_restore(outcome));
    }
}

fn describe_restore(outcome: &RestoreOutcome) -> String {
    match outcome {
        RestoreOutcome::Restored { records } => format!("restored ({} records)", records),
        RestoreOutcome::Absent => "absent on remote, local kept".to_string(),
        RestoreOutcome::Unavailable(e) => format!("unavailable: {}", e),
    }
}

async fn cmd_push(replica: &Replica, collection: &str) -> Result<()> {
    match replica.scheduler().request_sync(collection, true).await {
        SyncRequestOutcome::Pushed(PushOutcome::Pushed { version, attempts }) => {
            println!("Pushed {} as {} ({} attempt(s))", collection, version, attempts);
            Ok(())
        }
        SyncRequestOutcome::Pushed(PushOutcome::Unchanged { version }) => {
            println!("{} already up to date at {}", collection, version);
            Ok(())
        }
        SyncRequestOutcome::Pushed(PushOutcome::NoLocalContent) => {
            println!("{} has no local file, nothing to push", collection);
            Ok(())
        }
        SyncRequestOutcome::Failed(e) => Err(e).context(format!("Push of {} failed", collection)),
        other => Err(anyhow!("Unexpected sync outcome: {:?}", other)),
    }
}

async fn cmd_status(replica: &Replica) -> Result<()> {
    let local = replica.store().local();
    let mut collections = replica.config().collections.clone();
    for name in local.list().await? {
        if !collections.contains(&name) {
            collections.push(name);
        }
    }

    println!("Data dir: {}", local.root().display());
    println!("Remote:   {}", replica.client().remote().describe());
    println!();
    println!("{:<16} {:>8} {:>10}  {}", "COLLECTION", "RECORDS", "SIZE", "REMOTE");
    for collection in &collections {
        let records = match local.load(collection).await {
            Ok(Some(aggregate)) => aggregate.len().to_string(),
            Ok(None) => "-".to_string(),
            Err(e) => {
                warn!("Cannot read {}: {}", collection, e);
                "?".to_string()
            }
        };
        let size = local
            .size_of(collection)
            .await?
            .map(format_size)
            .unwrap_or_else(|| "-".to_string());
        let remote = match replica.client().remote_version(collection).await {
            Ok(Some(version)) => version.to_string(),
            Ok(None) => "absent".to_string(),
            Err(e) => format!("unavailable ({})", e),
        };
        println!("{:<16} {:>8} {:>10}  {}", collection, records, size, remote);
    }

    let status = replica.scheduler().status();
    if !status.is_empty() {
        println!();
        println!("Sync state:");
        for entry in status {
            let last_sync = entry
                .last_sync
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {:<16} last sync {}, pending {}, queued {}",
                entry.collection, last_sync, entry.pending, entry.queued
            );
            if let Some(error) = entry.last_error {
                println!("  {:<16} last error: {}", "", error);
            }
        }
    }
    Ok(())
}

async fn cmd_show(replica: &Replica, collection: &str, id: Option<&str>) -> Result<()> {
    let output = match id {
        Some(id) => {
            let record = replica
                .store()
                .read_record(collection, id)
                .await?
                .ok_or_else(|| anyhow!("No record {} in {}", id, collection))?;
            serde_json::to_string_pretty(&record)?
        }
        None => serde_json::to_string_pretty(&replica.store().read(collection).await?)?,
    };
    println!("{}", output);
    Ok(())
}

async fn cmd_watch(replica: &Replica) -> Result<()> {
    let mut events = replica.notifier().subscribe();
    let report = replica.start().await;
    print_report(&report);
    info!(
        "Watching {} (sync every {}s, retry every {}s); Ctrl-C to stop",
        replica.config().data_dir.display(),
        replica.config().sync_interval_secs,
        replica.config().retry_tick_secs
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticks = tokio::time::interval(replica.config().retry_tick());
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => info!("{:?} {}/{}", event.kind, event.collection, event.record_id),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} change events", n),
                Err(RecvError::Closed) => break,
            },
            _ = ticks.tick() => {
                let queued = replica.scheduler().queue().len();
                if queued > 0 {
                    info!("{} collection(s) waiting for sync", queued);
                }
            }
        }
    }

    info!("Shutting down");
    let results = replica.shutdown().await;
    for (collection, result) in results {
        match result {
            Ok(outcome) => info!("Flushed {}: {:?}", collection, outcome),
            Err(e) => warn!("Could not flush {}: {}", collection, e),
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
