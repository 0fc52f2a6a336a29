//! dirsync daemon entry point.
//!
//! Loads configuration, initializes the stores and the directory transport,
//! runs the sync scheduler and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use dirsync_core::blob::FsBlobStore;
use dirsync_core::config::AppConfig;
use dirsync_core::db::Database;
use dirsync_core::directory::LdapTransport;
use dirsync_core::sync_engine::SyncEngine;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// dirsync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "dirsync-daemon",
    version,
    about = "Directory to local identity store synchronization daemon"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single sync and exit; the exit status reflects the outcome.
    #[arg(long)]
    once: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and resolve configuration
    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = init_tracing(&log_level, &config)?;

    // Startup banner
    info!("========================================");
    info!("  dirsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Endpoints     : {}", config.directory.uris.to_vec().join(", "));
    info!("Search base   : {}", config.directory.search_base);
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    // Ensure data directory exists
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    // Initialize database
    let db_path = config.daemon.data_dir.join("dirsync.db");
    let db = Arc::new(Database::new(&db_path).context("failed to open database")?);
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    let blob_root = config.daemon.data_dir.join("blobs");
    let blobs = Arc::new(FsBlobStore::new(&blob_root).context("failed to open blob store")?);

    let transport =
        LdapTransport::new(&config.directory).context("failed to set up directory transport")?;

    let engine = Arc::new(SyncEngine::new(
        config.clone(),
        transport,
        db.clone(),
        db.clone(),
        blobs,
    ));
    info!("Sync engine initialized");

    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel::<()>(4);
    let poll_interval = Duration::from_secs(config.daemon.poll_interval_secs);
    let mut sched = scheduler::Scheduler::new(engine, db, poll_interval, trigger_rx);

    if args.once {
        let ok = sched.maybe_run("once").await;
        anyhow::ensure!(ok, "sync run failed");
        return Ok(());
    }

    signals::forward_sync_requests(trigger_tx);

    // Create a shutdown notify for cooperative cancellation
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();
    let stats = sched.stats();
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    let signal = signals::wait_for_shutdown().await;
    info!(%signal, "stopping");

    // A stored permit reaches the scheduler even mid-run.
    shutdown.notify_one();

    // Wait for the scheduler to finish its current run (up to 10s)
    match tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }

    info!(
        total_runs = stats.total_runs.load(Ordering::SeqCst),
        failed_runs = stats.failed_runs.load(Ordering::SeqCst),
        record_errors = stats.record_errors.load(Ordering::SeqCst),
        "dirsync daemon stopped."
    );
    Ok(())
}

/// Install the stdout subscriber, plus a daily-rotated file when
/// `daemon.log_dir` is set. The returned guard flushes the file writer.
fn init_tracing(log_level: &str, config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "dirsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}
