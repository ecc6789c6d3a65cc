//! Durable order-book storage.

pub mod book_store;

pub use book_store::{BookStore, InstrumentRecord, SnapshotId, StoredLevel, StoredSnapshot};

use rusqlite::ErrorCode;

/// Failure of one unit of work, or of the storage handle itself.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The handle is unusable; the caller must reopen before writing again.
    #[error("storage connection lost: {0}")]
    ConnectionLost(String),
    #[error("storage query failed: {0}")]
    Query(#[source] rusqlite::Error),
}

impl StorageError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        let lost = match &err {
            rusqlite::Error::SqliteFailure(e, _) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::FileLockingProtocolFailed
            ),
            _ => false,
        };

        if lost {
            Self::ConnectionLost(err.to_string())
        } else {
            Self::Query(err)
        }
    }
}
