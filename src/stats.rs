//! Lock-free ingest counters, summarised in the log on disconnect and shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub rejected: AtomicU64,
    pub throttled: AtomicU64,
    pub dispatched: AtomicU64,
    /// Admitted but not queued because the recorder queue was full or gone.
    pub dropped: AtomicU64,
    pub stored: AtomicU64,
    pub store_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub store_reopens: AtomicU64,
    pub reopen_failures: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub rejected: u64,
    pub throttled: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub stored: u64,
    pub store_failures: u64,
    pub reconnects: u64,
    pub store_reopens: u64,
    pub reopen_failures: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            store_reopens: self.store_reopens.load(Ordering::Relaxed),
            reopen_failures: self.reopen_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} rejected={} throttled={} dispatched={} dropped={} stored={} store_failures={} reconnects={} store_reopens={} reopen_failures={}",
            self.messages_received,
            self.rejected,
            self.throttled,
            self.dispatched,
            self.dropped,
            self.stored,
            self.store_failures,
            self.reconnects,
            self.store_reopens,
            self.reopen_failures
        )
    }
}
