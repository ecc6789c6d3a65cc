//! book-ingest - Upbit order-book recorder
//!
//! Resolves target codes, opens the SQLite store and hands both to the
//! supervisor, which streams until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use book_ingest::config::{resolve_symbols, Args, IngestConfig};
use book_ingest::feed::UpbitConnector;
use book_ingest::storage::BookStore;
use book_ingest::supervisor::Supervisor;
use book_ingest::throttle::ThrottleGate;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_file.as_deref())?;

    let config = IngestConfig::from_args(&args).context("Invalid configuration")?;

    let store = Arc::new(
        BookStore::open(&args.db_path)
            .with_context(|| format!("Failed to open order-book store at {}", args.db_path))?,
    );

    // Fatal before any connection attempt
    let (codes, source) = resolve_symbols(&args, &store).context("Failed to resolve symbols")?;
    info!(
        source = %source,
        count = codes.len(),
        "Subscribing to {}",
        codes.join(", ")
    );
    info!(
        store_interval_secs = config.store_interval.as_secs_f64(),
        print_spread = config.print_spread,
        db_path = %args.db_path,
        "⚙️ Ingest configuration"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "Signal handler failed, shutting down");
        } else {
            info!("🛑 Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    let gate = Arc::new(ThrottleGate::new(config.store_interval));
    let supervisor = Supervisor::new(
        UpbitConnector::new(config.feed.clone()),
        config.supervisor_config(codes),
        store,
        gate,
        shutdown_rx,
    );

    supervisor.run().await;
    Ok(())
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();
}

fn init_tracing(log_file: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "book_ingest=info".into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
