//! Backup Runner - Main entry point
//!
//! Runs one backup pass over the configured applications into a local directory transport.

mod agents;
mod config;
mod observer;

use crate::agents::build_registry;
use crate::config::RunnerConfig;
use crate::observer::LoggingObserver;
use anyhow::{bail, Result};
use backup_engine::journal::FileJournal;
use backup_engine::resources::DestinationLocks;
use backup_engine::transport::LocalTransport;
use backup_engine::{utils, BackupRunEngine, BackupTask, RunRequest, RunStatus};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Ignore stored state and back up everything from scratch
    #[arg(long)]
    non_incremental: bool,

    /// Mark the pass as requested by a user
    #[arg(long)]
    user_initiated: bool,

    /// Applications to back up (default: the journal, or every configured app)
    items: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = RunnerConfig::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting backup-runner v{} (destination: {})",
        env!("CARGO_PKG_VERSION"),
        config.transport.destination
    );

    let journal = config.journal.as_ref().map(FileJournal::new);
    let queue = select_queue(args.items, journal.as_ref(), &config)?;

    let transport = Arc::new(LocalTransport::new(config.transport_options()));
    let registry = Arc::new(build_registry(&config));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let engine = BackupRunEngine::new(config.engine.clone(), Arc::new(DestinationLocks::new()));
    let request = RunRequest::new(queue)
        .non_incremental(args.non_incremental)
        .user_initiated(args.user_initiated);

    let mut task = BackupTask::new(transport, registry, request)
        .with_observer(Arc::new(LoggingObserver))
        .with_cancel(cancel);
    if let Some(journal) = journal {
        task = task.with_journal(Arc::new(journal));
    }

    let result = engine.run(task).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.status != RunStatus::Success {
        bail!("Backup pass ended with status {:?}", result.status);
    }
    Ok(())
}

/// Explicit items win; otherwise the journal's dirty items; otherwise every configured app.
fn select_queue(
    items: Vec<String>,
    journal: Option<&FileJournal>,
    config: &RunnerConfig,
) -> Result<Vec<String>> {
    if !items.is_empty() {
        return Ok(items);
    }
    if let Some(journal) = journal {
        let dirty = journal.items()?;
        tracing::info!(items = dirty.len(), path = %journal.path().display(), "Using journal");
        return Ok(dirty);
    }
    Ok(config.apps.keys().cloned().collect())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, cancelling backup pass"),
        _ = terminate => tracing::info!("Received SIGTERM, cancelling backup pass"),
    }

    cancel.cancel();
}
