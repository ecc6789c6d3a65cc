//! Per-message path: decode, gate, hand off to the recorder.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::decoder::{decode, Rejected};
use crate::recorder::{BookRecorder, Submit};
use crate::spread::SpreadPrinter;
use crate::stats::IngestStats;
use crate::throttle::ThrottleGate;

/// What happened to one raw message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Rejected(Rejected),
    Throttled,
    Dispatched,
    /// Admitted, but the recorder could not take it.
    Dropped,
}

pub struct IngestPipeline {
    gate: Arc<ThrottleGate>,
    spread: Option<SpreadPrinter>,
    recorder: BookRecorder,
    stats: Arc<IngestStats>,
}

impl IngestPipeline {
    pub fn new(
        gate: Arc<ThrottleGate>,
        print_spread: bool,
        recorder: BookRecorder,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            gate,
            spread: print_spread.then(SpreadPrinter::new),
            recorder,
            stats,
        }
    }

    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Run one raw message through the pipeline.
    pub fn process(&self, raw: &[u8], arrival: Instant) -> Disposition {
        IngestStats::incr(&self.stats.messages_received);

        let update = match decode(raw) {
            Ok(update) => update,
            Err(rejected) => {
                IngestStats::incr(&self.stats.rejected);
                match &rejected {
                    Rejected::NotOrderbook(_) => trace!(reason = %rejected, "message skipped"),
                    _ => debug!(reason = %rejected, "message rejected"),
                }
                return Disposition::Rejected(rejected);
            }
        };

        if let Some(printer) = &self.spread {
            printer.observe(&update, arrival);
        }

        if !self.gate.admit_at(&update.code, arrival) {
            IngestStats::incr(&self.stats.throttled);
            return Disposition::Throttled;
        }

        let code = update.code.clone();
        match self.recorder.submit(update) {
            Submit::Queued => {
                IngestStats::incr(&self.stats.dispatched);
                Disposition::Dispatched
            }
            Submit::QueueFull => {
                IngestStats::incr(&self.stats.dropped);
                warn!(code = %code, "Recorder queue full, update dropped");
                Disposition::Dropped
            }
            Submit::Closed => {
                IngestStats::incr(&self.stats.dropped);
                warn!(code = %code, "Recorder stopped, update dropped");
                Disposition::Dropped
            }
        }
    }

    /// Flush queued updates and stop the recorder.
    pub async fn shutdown(&self) {
        self.recorder.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BookStore;
    use std::time::Duration;

    const BOOK: &str = r#"{"type":"orderbook","code":"KRW-BTC","timestamp":1700000000000,
        "total_ask_size":1.5,"total_bid_size":2.5,"stream_type":"REALTIME",
        "orderbook_units":[{"ask_price":101.0,"bid_price":100.0,"ask_size":0.5,"bid_size":1.0}]}"#;

    fn pipeline(interval: Duration, store: Arc<BookStore>) -> IngestPipeline {
        let stats = Arc::new(IngestStats::new());
        let (recorder, _lost) = BookRecorder::spawn(store, 16, stats.clone());
        IngestPipeline::new(Arc::new(ThrottleGate::new(interval)), false, recorder, stats)
    }

    #[tokio::test]
    async fn test_throttled_message_is_not_dispatched() {
        let store = Arc::new(BookStore::open_memory().unwrap());
        let pipeline = pipeline(Duration::from_secs(1), store.clone());
        let t0 = Instant::now();

        assert_eq!(pipeline.process(BOOK.as_bytes(), t0), Disposition::Dispatched);
        assert_eq!(
            pipeline.process(BOOK.as_bytes(), t0 + Duration::from_millis(10)),
            Disposition::Throttled
        );
        pipeline.shutdown().await;

        assert_eq!(store.snapshot_count("KRW-BTC").unwrap(), 1);
        let snap = pipeline.stats().snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.throttled, 1);
        assert_eq!(snap.stored, 1);
    }

    #[tokio::test]
    async fn test_rejected_message_leaves_gate_untouched() {
        let store = Arc::new(BookStore::open_memory().unwrap());
        let pipeline = pipeline(Duration::from_secs(1), store);

        let disposition = pipeline.process(br#"{"type":"ticker","code":"KRW-BTC"}"#, Instant::now());
        assert!(matches!(disposition, Disposition::Rejected(Rejected::NotOrderbook(_))));
        assert_eq!(pipeline.gate().tracked(), 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_recorder_drops() {
        let store = Arc::new(BookStore::open_memory().unwrap());
        let pipeline = pipeline(Duration::ZERO, store);
        pipeline.shutdown().await;

        assert_eq!(pipeline.process(BOOK.as_bytes(), Instant::now()), Disposition::Dropped);
        assert_eq!(pipeline.stats().snapshot().dropped, 1);
    }
}
