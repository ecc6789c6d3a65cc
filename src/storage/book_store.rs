//! SQLite-backed order-book snapshot storage.
//!
//! - One unit of work per update: instrument resolution, snapshot row and
//!   every level row commit together or not at all
//! - Instrument rows are created with a conditional insert on the unique
//!   code, then re-read, so racing first sightings converge on one row
//! - `BEGIN IMMEDIATE` + busy timeout so concurrent writers queue on the
//!   file lock instead of failing
//! - Table layout is shared with the export/report/cleanup tooling and
//!   must not drift

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::StorageError;
use crate::models::{CurrencyPair, OrderBookUpdate};

pub type SnapshotId = i64;

const IN_MEMORY: &str = ":memory:";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// STORAGE SCHEMA
// =============================================================================

const BOOK_STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS upbit_symbols (
    symbol_id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol_code TEXT NOT NULL UNIQUE,
    base_currency TEXT NOT NULL,
    quote_currency TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS upbit_orderbook_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol_id INTEGER NOT NULL REFERENCES upbit_symbols(symbol_id),
    timestamp INTEGER NOT NULL,
    total_ask_size REAL,
    total_bid_size REAL,
    stream_type TEXT,
    units_count INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upbit_snapshots_symbol_ts
    ON upbit_orderbook_snapshots(symbol_id, timestamp);

CREATE TABLE IF NOT EXISTS upbit_order_book_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES upbit_orderbook_snapshots(snapshot_id),
    symbol_id INTEGER NOT NULL REFERENCES upbit_symbols(symbol_id),
    timestamp INTEGER NOT NULL,
    ask_price REAL NOT NULL,
    bid_price REAL NOT NULL,
    ask_size REAL NOT NULL,
    bid_size REAL NOT NULL,
    unit_level INTEGER NOT NULL,
    UNIQUE (snapshot_id, unit_level)
);

CREATE INDEX IF NOT EXISTS idx_upbit_book_data_symbol_ts
    ON upbit_order_book_data(symbol_id, timestamp);
"#;

const INSERT_SYMBOL_SQL: &str = "INSERT OR IGNORE INTO upbit_symbols \
     (symbol_code, base_currency, quote_currency) VALUES (?1, ?2, ?3)";

const SELECT_SYMBOL_ID_SQL: &str = "SELECT symbol_id FROM upbit_symbols WHERE symbol_code = ?1";

const INSERT_SNAPSHOT_SQL: &str = "INSERT INTO upbit_orderbook_snapshots \
     (symbol_id, timestamp, total_ask_size, total_bid_size, stream_type, units_count) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_LEVEL_SQL: &str = "INSERT INTO upbit_order_book_data \
     (snapshot_id, symbol_id, timestamp, ask_price, bid_price, ask_size, bid_size, unit_level) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

// =============================================================================
// ROW TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRecord {
    pub symbol_id: i64,
    pub code: String,
    pub base_currency: String,
    pub quote_currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub snapshot_id: SnapshotId,
    pub symbol_id: i64,
    pub timestamp: i64,
    pub total_ask_size: Option<f64>,
    pub total_bid_size: Option<f64>,
    pub stream_type: Option<String>,
    pub units_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredLevel {
    pub snapshot_id: SnapshotId,
    pub symbol_id: i64,
    pub timestamp: i64,
    pub ask_price: f64,
    pub bid_price: f64,
    pub ask_size: f64,
    pub bid_size: f64,
    pub rank: i64,
}

// =============================================================================
// BOOK STORE
// =============================================================================

/// Single shared storage handle. Writes serialize on the mutex.
pub struct BookStore {
    path: String,
    conn: Mutex<Option<Connection>>,
    /// Bumped on every reopen; lets callers tell failures on a replaced
    /// connection from failures on the current one.
    generation: AtomicU64,
}

impl BookStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: &str) -> Result<Self, StorageError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::ConnectionLost(e.to_string()))?;
            }
        }

        let conn = Self::connect(db_path)?;
        info!(path = %db_path, "📊 Order-book store opened");

        Ok(Self {
            path: db_path.to_string(),
            conn: Mutex::new(Some(conn)),
            generation: AtomicU64::new(0),
        })
    }

    /// In-memory store (for testing). `reopen` on it starts from an empty database.
    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Self::connect(IN_MEMORY)?;
        Ok(Self {
            path: IN_MEMORY.to_string(),
            conn: Mutex::new(Some(conn)),
            generation: AtomicU64::new(0),
        })
    }

    fn connect(db_path: &str) -> Result<Connection, StorageError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| StorageError::ConnectionLost(format!("open {}: {}", db_path, e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(BOOK_STORE_SCHEMA)?;

        Ok(conn)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Connection generation, starting at 0.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Replace the connection with a fresh one.
    pub fn reopen(&self) -> Result<(), StorageError> {
        let conn = Self::connect(&self.path)?;
        let previous = {
            let mut guard = self.conn.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            guard.replace(conn)
        };
        if let Some(old) = previous {
            if let Err((_, e)) = old.close() {
                warn!(error = %e, "Failed to close previous storage connection");
            }
        }
        info!(path = %self.path, "♻️ Order-book store reopened");
        Ok(())
    }

    /// Release the connection. Later calls fail with `ConnectionLost`.
    pub fn close(&self) -> Result<(), StorageError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StorageError::from(e))?;
        info!(path = %self.path, "Order-book store closed");
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| StorageError::ConnectionLost("storage handle is closed".to_string()))?;
        f(conn)
    }

    /// Persist one update as a snapshot plus its ranked levels.
    pub fn store(&self, update: &OrderBookUpdate) -> Result<SnapshotId, StorageError> {
        let pair = CurrencyPair::from_code(&update.code);

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Step 1: insert-if-absent, then re-read. Never select-then-insert.
            let created = tx.execute(
                INSERT_SYMBOL_SQL,
                params![update.code, pair.base, pair.quote],
            )?;
            let symbol_id: i64 =
                tx.query_row(SELECT_SYMBOL_ID_SQL, params![update.code], |row| row.get(0))?;

            // Step 2
            tx.execute(
                INSERT_SNAPSHOT_SQL,
                params![
                    symbol_id,
                    update.timestamp,
                    update.total_ask_size,
                    update.total_bid_size,
                    update.stream_type,
                    update.levels.len() as i64,
                ],
            )?;
            let snapshot_id = tx.last_insert_rowid();

            // Step 3
            {
                let mut stmt = tx.prepare_cached(INSERT_LEVEL_SQL)?;
                for (rank, level) in update.ranked_levels() {
                    stmt.execute(params![
                        snapshot_id,
                        symbol_id,
                        update.timestamp,
                        level.ask_price,
                        level.bid_price,
                        level.ask_size,
                        level.bid_size,
                        rank,
                    ])?;
                }
            }

            tx.commit()?;

            if created > 0 {
                info!(
                    code = %update.code,
                    symbol_id,
                    base = %pair.base,
                    quote = %pair.quote,
                    "🆕 Created new symbol"
                );
            }
            debug!(
                code = %update.code,
                snapshot_id,
                levels = update.levels.len(),
                "Stored snapshot"
            );

            Ok(snapshot_id)
        })
    }

    // =========================================================================
    // READ HELPERS
    // =========================================================================

    /// Every known symbol code, ordered.
    pub fn known_symbols(&self) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT symbol_code FROM upbit_symbols ORDER BY symbol_code")?;
            let codes = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(codes)
        })
    }

    pub fn instrument(&self, code: &str) -> Result<Option<InstrumentRecord>, StorageError> {
        self.with_conn(|conn| {
            let record = conn
                .query_row(
                    "SELECT symbol_id, symbol_code, base_currency, quote_currency
                     FROM upbit_symbols WHERE symbol_code = ?1",
                    params![code],
                    |row| {
                        Ok(InstrumentRecord {
                            symbol_id: row.get(0)?,
                            code: row.get(1)?,
                            base_currency: row.get(2)?,
                            quote_currency: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Rows carrying `code`. The unique constraint keeps this at 0 or 1.
    pub fn instrument_count(&self, code: &str) -> Result<u64, StorageError> {
        self.count(
            "SELECT COUNT(*) FROM upbit_symbols WHERE symbol_code = ?1",
            code,
        )
    }

    pub fn snapshot_count(&self, code: &str) -> Result<u64, StorageError> {
        self.count(
            "SELECT COUNT(*) FROM upbit_orderbook_snapshots s
             JOIN upbit_symbols sym ON sym.symbol_id = s.symbol_id
             WHERE sym.symbol_code = ?1",
            code,
        )
    }

    pub fn level_row_count(&self, code: &str) -> Result<u64, StorageError> {
        self.count(
            "SELECT COUNT(*) FROM upbit_order_book_data d
             JOIN upbit_symbols sym ON sym.symbol_id = d.symbol_id
             WHERE sym.symbol_code = ?1",
            code,
        )
    }

    fn count(&self, sql: &str, code: &str) -> Result<u64, StorageError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(sql, params![code], |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    /// Feed timestamps of every snapshot for `code`, in insert order.
    pub fn snapshot_timestamps(&self, code: &str) -> Result<Vec<i64>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT s.timestamp FROM upbit_orderbook_snapshots s
                 JOIN upbit_symbols sym ON sym.symbol_id = s.symbol_id
                 WHERE sym.symbol_code = ?1
                 ORDER BY s.snapshot_id",
            )?;
            let ts = stmt
                .query_map(params![code], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ts)
        })
    }

    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Result<Option<StoredSnapshot>, StorageError> {
        self.with_conn(|conn| {
            let snapshot = conn
                .query_row(
                    "SELECT snapshot_id, symbol_id, timestamp, total_ask_size, total_bid_size,
                            stream_type, units_count
                     FROM upbit_orderbook_snapshots WHERE snapshot_id = ?1",
                    params![snapshot_id],
                    |row| {
                        Ok(StoredSnapshot {
                            snapshot_id: row.get(0)?,
                            symbol_id: row.get(1)?,
                            timestamp: row.get(2)?,
                            total_ask_size: row.get(3)?,
                            total_bid_size: row.get(4)?,
                            stream_type: row.get(5)?,
                            units_count: row.get(6)?,
                        })
                    },
                )
                .optional()?;
            Ok(snapshot)
        })
    }

    /// Level rows of one snapshot, ordered by rank.
    pub fn levels(&self, snapshot_id: SnapshotId) -> Result<Vec<StoredLevel>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT snapshot_id, symbol_id, timestamp, ask_price, bid_price,
                        ask_size, bid_size, unit_level
                 FROM upbit_order_book_data
                 WHERE snapshot_id = ?1
                 ORDER BY unit_level",
            )?;
            let levels = stmt
                .query_map(params![snapshot_id], |row| {
                    Ok(StoredLevel {
                        snapshot_id: row.get(0)?,
                        symbol_id: row.get(1)?,
                        timestamp: row.get(2)?,
                        ask_price: row.get(3)?,
                        bid_price: row.get(4)?,
                        ask_size: row.get(5)?,
                        bid_size: row.get(6)?,
                        rank: row.get(7)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(levels)
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
