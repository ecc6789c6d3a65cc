//! Streaming feed seam.
//!
//! A connector performs the handshake and subscription; the session it
//! returns yields raw messages until it terminates. Sessions never retry
//! on their own: every termination surfaces as an error and the
//! supervisor decides what happens next.

pub mod upbit_ws;

use async_trait::async_trait;
use std::time::Duration;

pub use upbit_ws::{UpbitConnector, UpbitFeedConfig, UpbitSession, UPBIT_WS_ENDPOINT};

/// Update type requested in every subscription.
pub const ORDERBOOK_UPDATE_TYPE: &str = "orderbook";

/// Payload format selector.
pub const DEFAULT_FORMAT: &str = "DEFAULT";

/// Why a session ended or a connect attempt failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("no inbound frame for {0:?}")]
    IdleTimeout(Duration),
    #[error("closed by remote ({0:?})")]
    Closed(Option<String>),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// The single subscription request sent on each connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub ticket: String,
    pub update_type: String,
    pub codes: Vec<String>,
    pub format: String,
}

impl Subscription {
    pub fn orderbook(ticket: impl Into<String>, codes: Vec<String>) -> Self {
        Self {
            ticket: ticket.into(),
            update_type: ORDERBOOK_UPDATE_TYPE.to_string(),
            codes,
            format: DEFAULT_FORMAT.to_string(),
        }
    }

    /// Wire form: `[{"ticket":..},{"type":..,"codes":[..]},{"format":..}]`.
    pub fn to_message(&self) -> String {
        serde_json::json!([
            { "ticket": self.ticket },
            { "type": self.update_type, "codes": self.codes },
            { "format": self.format },
        ])
        .to_string()
    }
}

#[async_trait]
pub trait FeedConnector: Send + Sync {
    type Session: FeedSession;

    /// Connect and send the subscription. Returns once the feed is streaming.
    async fn connect(&self, subscription: &Subscription) -> Result<Self::Session, FeedError>;
}

#[async_trait]
pub trait FeedSession: Send {
    /// Next raw message. Any error is terminal for this session.
    async fn recv(&mut self) -> Result<Vec<u8>, FeedError>;

    /// Close the transport. Safe to call more than once.
    async fn close(&mut self);
}
