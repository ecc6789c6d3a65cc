//! Upbit order-book message decoding.
//!
//! Upbit pushes JSON (inside binary frames by default):
//! `{"type":"orderbook","code":"KRW-BTC","timestamp":1529910247984,
//!   "total_ask_size":8.8,"total_bid_size":2.4,"stream_type":"REALTIME",
//!   "orderbook_units":[{"ask_price":6956000.0,"bid_price":6954000.0,
//!   "ask_size":0.24,"bid_size":0.007}, ...]}`
//!
//! Anything that is not an order-book message is rejected without
//! escalation; the receive loop drops it.

use serde::Deserialize;

use crate::models::{OrderBookUpdate, PriceLevel};

/// Type tag carried by order-book messages.
pub const ORDERBOOK_TYPE: &str = "orderbook";

/// Why a raw message did not produce an update.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejected {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("not an orderbook message (type={0:?})")]
    NotOrderbook(Option<String>),
    #[error("malformed orderbook message: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct WireOrderBook {
    code: String,
    timestamp: i64,
    #[serde(default)]
    total_ask_size: Option<f64>,
    #[serde(default)]
    total_bid_size: Option<f64>,
    #[serde(default)]
    stream_type: Option<String>,
    orderbook_units: Vec<WireUnit>,
}

#[derive(Debug, Deserialize)]
struct WireUnit {
    ask_price: f64,
    bid_price: f64,
    ask_size: f64,
    bid_size: f64,
}

/// Decode one raw feed message.
pub fn decode(raw: &[u8]) -> Result<OrderBookUpdate, Rejected> {
    let json: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| Rejected::InvalidJson(e.to_string()))?;

    // Cheap tag check before the typed parse; heartbeats and status frames stop here.
    let tag = json.get("type").and_then(|v| v.as_str());
    if tag != Some(ORDERBOOK_TYPE) {
        return Err(Rejected::NotOrderbook(tag.map(str::to_string)));
    }

    let msg: WireOrderBook =
        serde_json::from_value(json).map_err(|e| Rejected::Malformed(e.to_string()))?;

    if msg.code.trim().is_empty() {
        return Err(Rejected::Malformed("empty code".to_string()));
    }

    let levels = msg
        .orderbook_units
        .into_iter()
        .map(|u| PriceLevel {
            ask_price: u.ask_price,
            bid_price: u.bid_price,
            ask_size: u.ask_size,
            bid_size: u.bid_size,
        })
        .collect();

    Ok(OrderBookUpdate {
        code: msg.code,
        timestamp: msg.timestamp,
        total_ask_size: msg.total_ask_size,
        total_bid_size: msg.total_bid_size,
        stream_type: msg.stream_type,
        levels,
    })
}
