//! Async book recorder.
//!
//! Decouples the receive loop from SQLite: admitted updates are queued
//! and a single writer task stores them in arrival order, each store on
//! the blocking pool. A lost storage connection is reported back to the
//! supervisor through a separate channel.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::OrderBookUpdate;
use crate::stats::IngestStats;
use crate::storage::BookStore;

/// Notification that the storage handle needs a reopen.
#[derive(Debug, Clone)]
pub struct StorageLost {
    pub reason: String,
    /// Store generation the failed write ran against.
    pub generation: u64,
}

impl StorageLost {
    /// Raised against a connection that has since been replaced.
    pub fn is_stale(&self, current_generation: u64) -> bool {
        self.generation < current_generation
    }
}

enum RecorderMessage {
    Update(OrderBookUpdate),
    Shutdown,
}

/// Result of handing an update to the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// Queue full; the update was discarded.
    QueueFull,
    /// Writer already stopped.
    Closed,
}

pub struct BookRecorder {
    tx: mpsc::Sender<RecorderMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BookRecorder {
    /// Spawn the writer task.
    pub fn spawn(
        store: Arc<BookStore>,
        capacity: usize,
        stats: Arc<IngestStats>,
    ) -> (Self, mpsc::Receiver<StorageLost>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (lost_tx, lost_rx) = mpsc::channel(16);

        let handle = tokio::spawn(async move {
            Self::run_writer(store, rx, stats, lost_tx).await;
        });

        (
            Self {
                tx,
                handle: Mutex::new(Some(handle)),
            },
            lost_rx,
        )
    }

    /// Queue an update without waiting.
    pub fn submit(&self, update: OrderBookUpdate) -> Submit {
        match self.tx.try_send(RecorderMessage::Update(update)) {
            Ok(()) => Submit::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Submit::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => Submit::Closed,
        }
    }

    /// Drain everything already queued, then stop the writer.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(RecorderMessage::Shutdown).await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Book recorder task failed");
            }
        }
    }

    async fn run_writer(
        store: Arc<BookStore>,
        mut rx: mpsc::Receiver<RecorderMessage>,
        stats: Arc<IngestStats>,
        lost_tx: mpsc::Sender<StorageLost>,
    ) {
        while let Some(msg) = rx.recv().await {
            match msg {
                RecorderMessage::Update(update) => {
                    Self::persist(&store, update, &stats, &lost_tx).await;
                }
                RecorderMessage::Shutdown => break,
            }
        }
        info!("Book recorder shutting down");
    }

    async fn persist(
        store: &Arc<BookStore>,
        update: OrderBookUpdate,
        stats: &IngestStats,
        lost_tx: &mpsc::Sender<StorageLost>,
    ) {
        let code = update.code.clone();
        let store = store.clone();

        // Read before the write: a reopen racing in between can only make a
        // real fault look stale, and the next failing write reports again.
        let written = tokio::task::spawn_blocking(move || {
            let generation = store.generation();
            (generation, store.store(&update))
        });

        match written.await {
            Ok((_, Ok(snapshot_id))) => {
                IngestStats::incr(&stats.stored);
                debug!(code = %code, snapshot_id, "snapshot persisted");
            }
            Ok((generation, Err(e))) => {
                IngestStats::incr(&stats.store_failures);
                error!(code = %code, error = %e, "Failed to store snapshot");
                if e.is_connection_lost() {
                    // Full means a reopen is already pending
                    let _ = lost_tx.try_send(StorageLost {
                        reason: e.to_string(),
                        generation,
                    });
                }
            }
            Err(e) => {
                IngestStats::incr(&stats.store_failures);
                warn!(code = %code, error = %e, "Store task aborted");
            }
        }
    }
}
