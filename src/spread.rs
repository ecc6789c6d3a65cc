//! Optional spread printing.
//!
//! Shares the decoded update with persistence but runs on its own
//! once-per-second gate, so enabling it never changes write cadence.

use chrono::{TimeZone, Utc};
use std::time::{Duration, Instant};
use tracing::info;

use crate::models::{OrderBookUpdate, SpreadQuote};
use crate::throttle::ThrottleGate;

const PRINT_INTERVAL: Duration = Duration::from_secs(1);

pub struct SpreadPrinter {
    gate: ThrottleGate,
}

impl Default for SpreadPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpreadPrinter {
    pub fn new() -> Self {
        Self {
            gate: ThrottleGate::new(PRINT_INTERVAL),
        }
    }

    /// Log the spread for `update` if this code has not printed in the last second.
    ///
    /// Returns the quote that was printed.
    pub fn observe(&self, update: &OrderBookUpdate, arrival: Instant) -> Option<SpreadQuote> {
        let quote = update.spread()?;
        if !self.gate.admit_at(&update.code, arrival) {
            return None;
        }

        let ts = Utc
            .timestamp_millis_opt(update.timestamp)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| update.timestamp.to_string());

        info!(
            code = %update.code,
            ts = %ts,
            max_ask = quote.max_ask.ask_price,
            max_ask_qty = quote.max_ask.ask_size,
            min_bid = quote.min_bid.bid_price,
            min_bid_qty = quote.min_bid.bid_size,
            spread = quote.spread,
            "📈 spread"
        );

        Some(quote)
    }
}
