use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use trialgate::application::engine::TrialEngine;
use trialgate::application::maintenance;
use trialgate::config::EngineConfig;
use trialgate::domain::clock::SystemClock;
use trialgate::infrastructure::Storage;
use trialgate::infrastructure::processor::LoggingProcessor;
use trialgate::interfaces::csv::history_writer::HistoryWriter;
use trialgate::interfaces::http::router;
use trialgate::telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the maintenance sweep in the background
    Serve {
        /// Listen address, overriding the configuration
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one maintenance pass (expiry, then pending reconciliation) and exit
    Sweep,
    /// Export a user's subscription history as CSV on stdout
    History {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).into_diagnostic()?;
    telemetry::init(&config.logging.level);

    let storage = match cli.db_path.as_deref().or(config.storage.db_path.as_deref()) {
        Some(path) => open_storage(path)?,
        None => Storage::in_memory(),
    };
    let engine = TrialEngine::new(
        &config,
        storage,
        Arc::new(LoggingProcessor),
        Arc::new(SystemClock),
    );

    match cli.command {
        Command::Serve { bind } => serve(engine, &config, bind).await,
        Command::Sweep => {
            let report = maintenance::run_once(&engine.ledger).await.into_diagnostic()?;
            println!(
                "expired={} promoted={} superseded={} refused={} failed={}",
                report.expired,
                report.reconciled.promoted,
                report.reconciled.superseded,
                report.reconciled.refused,
                report.reconciled.failed
            );
            Ok(())
        }
        Command::History { user } => {
            let history = engine.query.history(&user).await.into_diagnostic()?;
            let stdout = io::stdout();
            let mut writer = HistoryWriter::new(stdout.lock());
            writer.write_history(&history).into_diagnostic()?;
            Ok(())
        }
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_storage(path: &Path) -> Result<Storage> {
    Storage::rocksdb(path).into_diagnostic()
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_storage(_path: &Path) -> Result<Storage> {
    eprintln!(
        "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
    );
    Ok(Storage::in_memory())
}

async fn serve(engine: TrialEngine, config: &EngineConfig, bind: Option<String>) -> Result<()> {
    if config.webhook.secret.is_empty() {
        warn!("webhook secret is not configured; every webhook delivery will be rejected");
    }
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);

    let sweeper = maintenance::spawn(
        engine.ledger.clone(),
        Duration::from_secs(config.trial.sweep_interval_secs.max(1)),
        shutdown_tx.subscribe(),
    );

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .into_diagnostic()?;
    info!(%bind, "trialgate listening");

    let mut server_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(listener, router(engine)).with_graceful_shutdown(async move {
        let _ = server_shutdown.recv().await;
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = signal_tx.send(());
        }
    });

    server.await.into_diagnostic()?;
    let _ = shutdown_tx.send(());
    let _ = sweeper.await;
    Ok(())
}
