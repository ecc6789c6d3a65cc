//! Command-line / environment configuration and target-code resolution.

use clap::Parser;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::feed::{Subscription, UpbitFeedConfig, UPBIT_WS_ENDPOINT};
use crate::storage::{BookStore, StorageError};
use crate::supervisor::SupervisorConfig;
use crate::throttle::interval_from_secs_f64;

/// Upper bound for every timer flag. Larger values would overflow deadline math.
pub const MAX_TIMER_SECS: u64 = 7 * 24 * 3600;

#[derive(Parser, Debug, Clone)]
#[command(name = "book-ingest")]
#[command(about = "Stream Upbit order books into SQLite")]
pub struct Args {
    /// Comma-separated codes, e.g. KRW-BTC,KRW-ETH
    #[arg(long, env = "UPBIT_SYMBOLS")]
    pub symbols: Option<String>,

    /// One code per line; blank lines and `#` comments skipped
    #[arg(long, env = "UPBIT_SYMBOLS_FILE", default_value = "symbols.txt")]
    pub symbols_file: String,

    /// Minimum seconds between stored snapshots per code (0 stores everything)
    #[arg(long, env = "UPBIT_STORE_INTERVAL", default_value_t = 1.0)]
    pub store_interval: f64,

    /// Log the spread once per second per code
    #[arg(long)]
    pub print_spread: bool,

    #[arg(long, env = "UPBIT_DB_PATH", default_value = "upbit_orderbook.db")]
    pub db_path: String,

    #[arg(long, env = "UPBIT_WS_ENDPOINT", default_value = UPBIT_WS_ENDPOINT)]
    pub endpoint: String,

    #[arg(long, default_value = "dnk")]
    pub ticket: String,

    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(0..=MAX_TIMER_SECS))]
    pub retry_delay_secs: u64,

    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..=MAX_TIMER_SECS))]
    pub ping_interval_secs: u64,

    #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u64).range(1..=MAX_TIMER_SECS))]
    pub idle_timeout_secs: u64,

    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..=MAX_TIMER_SECS))]
    pub connect_timeout_secs: u64,

    #[arg(long, default_value_t = 4096)]
    pub queue_capacity: usize,

    /// Also write logs to this file
    #[arg(long, env = "UPBIT_LOG_FILE")]
    pub log_file: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no symbols to subscribe: pass --symbols, provide a symbols file, or populate the database")]
    NoInstruments,
    #[error("failed to read symbols file {path}: {source}")]
    SymbolsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid store interval {value}: {reason}")]
    InvalidStoreInterval { value: f64, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where the target codes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSource {
    CommandLine,
    File,
    Database,
}

impl std::fmt::Display for SymbolSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandLine => write!(f, "command line"),
            Self::File => write!(f, "symbols file"),
            Self::Database => write!(f, "database"),
        }
    }
}

/// Runtime settings derived from [`Args`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub feed: UpbitFeedConfig,
    pub ticket: String,
    pub store_interval: Duration,
    pub print_spread: bool,
    pub retry_delay: Duration,
    pub queue_capacity: usize,
}

impl IngestConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let store_interval = interval_from_secs_f64(args.store_interval).map_err(|e| {
            ConfigError::InvalidStoreInterval {
                value: args.store_interval,
                reason: e.to_string(),
            }
        })?;
        let timer = |secs: u64| Duration::from_secs(secs.clamp(1, MAX_TIMER_SECS));

        Ok(Self {
            feed: UpbitFeedConfig {
                endpoint: args.endpoint.clone(),
                ping_interval: timer(args.ping_interval_secs),
                idle_timeout: timer(args.idle_timeout_secs),
                connect_timeout: timer(args.connect_timeout_secs),
            },
            ticket: args.ticket.clone(),
            store_interval,
            print_spread: args.print_spread,
            retry_delay: Duration::from_secs(args.retry_delay_secs.min(MAX_TIMER_SECS)),
            queue_capacity: args.queue_capacity.max(1),
        })
    }

    pub fn supervisor_config(&self, codes: Vec<String>) -> SupervisorConfig {
        SupervisorConfig {
            subscription: Subscription::orderbook(self.ticket.clone(), codes),
            retry_delay: self.retry_delay,
            print_spread: self.print_spread,
            queue_capacity: self.queue_capacity,
        }
    }
}

// =============================================================================
// SYMBOL RESOLUTION
// =============================================================================

/// Split, trim, upper-case and de-duplicate (first occurrence wins).
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    normalize(raw.split(','))
}

fn normalize<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for item in items {
        let code = item.trim().to_uppercase();
        if !code.is_empty() && !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

/// Read a symbols file. A missing file yields an empty list.
pub fn read_symbols_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Symbols file not found");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(ConfigError::SymbolsFile {
                path: path.display().to_string(),
                source,
            })
        }
    };

    Ok(normalize(
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#')),
    ))
}

/// Target codes by precedence: explicit list, then file, then every code
/// already in the store.
pub fn resolve_symbols(
    args: &Args,
    store: &BookStore,
) -> Result<(Vec<String>, SymbolSource), ConfigError> {
    if let Some(raw) = args.symbols.as_deref() {
        let codes = parse_symbol_list(raw);
        if !codes.is_empty() {
            return Ok((codes, SymbolSource::CommandLine));
        }
    }

    let codes = read_symbols_file(Path::new(&args.symbols_file))?;
    if !codes.is_empty() {
        info!(path = %args.symbols_file, count = codes.len(), "Loaded symbols from file");
        return Ok((codes, SymbolSource::File));
    }

    let codes = store.known_symbols()?;
    if !codes.is_empty() {
        info!(count = codes.len(), "Using all symbols from database");
        return Ok((codes, SymbolSource::Database));
    }

    Err(ConfigError::NoInstruments)
}
