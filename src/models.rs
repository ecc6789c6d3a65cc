//! Order-book domain types shared by the decoder, gate and storage layers.

use serde::{Deserialize, Serialize};

/// Quote currency assumed for codes that carry no `QUOTE-BASE` delimiter.
pub const DEFAULT_QUOTE_CURRENCY: &str = "KRW";

const CODE_DELIMITER: char = '-';

/// One rung of the book as delivered by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub ask_price: f64,
    pub bid_price: f64,
    pub ask_size: f64,
    pub bid_size: f64,
}

/// A decoded order-book update.
///
/// `levels` keeps feed order; rank is the 1-based position in that vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    pub code: String,
    /// Exchange timestamp in milliseconds.
    pub timestamp: i64,
    pub total_ask_size: Option<f64>,
    pub total_bid_size: Option<f64>,
    pub stream_type: Option<String>,
    pub levels: Vec<PriceLevel>,
}

/// Max-ask / min-bid view over every level of one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadQuote {
    pub max_ask: PriceLevel,
    pub min_bid: PriceLevel,
    pub spread: f64,
}

impl OrderBookUpdate {
    /// Ranked levels, `(1, first), (2, second), ...`.
    pub fn ranked_levels(&self) -> impl Iterator<Item = (i64, &PriceLevel)> {
        self.levels
            .iter()
            .enumerate()
            .map(|(idx, level)| (idx as i64 + 1, level))
    }

    /// `max(ask_price) - min(bid_price)` across all levels.
    pub fn spread(&self) -> Option<SpreadQuote> {
        let max_ask = self
            .levels
            .iter()
            .copied()
            .max_by(|a, b| a.ask_price.total_cmp(&b.ask_price))?;
        let min_bid = self
            .levels
            .iter()
            .copied()
            .min_by(|a, b| a.bid_price.total_cmp(&b.bid_price))?;

        Some(SpreadQuote {
            max_ask,
            min_bid,
            spread: max_ask.ask_price - min_bid.bid_price,
        })
    }
}

/// Base/quote pair derived from an instrument code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    /// Upbit codes read `QUOTE-BASE` (`KRW-BTC`). Only the first delimiter splits.
    pub fn from_code(code: &str) -> Self {
        match code.split_once(CODE_DELIMITER) {
            Some((quote, base)) => Self {
                base: base.to_string(),
                quote: quote.to_string(),
            },
            None => Self {
                base: code.to_string(),
                quote: DEFAULT_QUOTE_CURRENCY.to_string(),
            },
        }
    }
}
