//! Upbit order-book ingestion.
//!
//! Streams order-book updates from the Upbit websocket feed, throttles them
//! per instrument and persists snapshots plus ranked levels to SQLite.
//! The binary in `main.rs` wires these together; tests drive the same
//! pieces with scripted feeds.

pub mod config;
pub mod decoder;
pub mod feed;
pub mod models;
pub mod pipeline;
pub mod recorder;
pub mod spread;
pub mod stats;
pub mod storage;
pub mod supervisor;
pub mod throttle;
