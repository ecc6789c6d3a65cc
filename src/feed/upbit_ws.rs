//! Upbit public WebSocket client.
//!
//! One connection per session: upgrade, send the subscription, then read
//! frames. Liveness is kept with client pings; a session that sees no
//! inbound frame (data, ping or pong) for `idle_timeout` ends itself.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use super::{FeedConnector, FeedError, FeedSession, Subscription};

// =============================================================================
// CONFIGURATION
// =============================================================================

pub const UPBIT_WS_ENDPOINT: &str = "wss://api.upbit.com/websocket/v1";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for timer waits; longer settings behave as "never".
const LONGEST_WAIT: Duration = Duration::from_secs(365 * 24 * 3600);

/// `from + after`, saturating instead of overflowing `Instant`.
fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(LONGEST_WAIT))
        .unwrap_or(from)
}

#[derive(Debug, Clone)]
pub struct UpbitFeedConfig {
    pub endpoint: String,
    pub ping_interval: Duration,
    /// Ping interval plus the grace period a pong may take.
    pub idle_timeout: Duration,
    /// Upgrade plus subscription send.
    pub connect_timeout: Duration,
}

impl Default for UpbitFeedConfig {
    fn default() -> Self {
        Self {
            endpoint: UPBIT_WS_ENDPOINT.to_string(),
            ping_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(80),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// CONNECTOR
// =============================================================================

pub struct UpbitConnector {
    config: UpbitFeedConfig,
}

impl UpbitConnector {
    pub fn new(config: UpbitFeedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UpbitFeedConfig {
        &self.config
    }

    async fn handshake(
        &self,
        subscription: &Subscription,
    ) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>), FeedError> {
        let (ws_stream, resp) = connect_async(self.config.endpoint.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        debug!(status = %resp.status(), "websocket upgraded");

        let (mut write, read) = ws_stream.split();
        write
            .send(Message::Text(subscription.to_message()))
            .await
            .map_err(|e| FeedError::Send(e.to_string()))?;

        Ok((write, read))
    }
}

#[async_trait]
impl FeedConnector for UpbitConnector {
    type Session = UpbitSession;

    async fn connect(&self, subscription: &Subscription) -> Result<UpbitSession, FeedError> {
        info!(
            endpoint = %self.config.endpoint,
            codes = %subscription.codes.join(", "),
            "🔌 Connecting to Upbit WebSocket"
        );

        let (write, read) = timeout(self.config.connect_timeout, self.handshake(subscription))
            .await
            .map_err(|_| FeedError::Timeout(self.config.connect_timeout))??;

        info!("✅ Subscription sent. Streaming order books...");

        let now = Instant::now();
        let period = self
            .config
            .ping_interval
            .clamp(Duration::from_millis(1), LONGEST_WAIT);
        let mut ping = interval_at(deadline(now, period), period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(UpbitSession {
            write,
            read,
            ping,
            idle_timeout: self.config.idle_timeout,
            last_activity: now,
            closed: false,
        })
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct UpbitSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping: Interval,
    idle_timeout: Duration,
    last_activity: Instant,
    closed: bool,
}

#[async_trait]
impl FeedSession for UpbitSession {
    async fn recv(&mut self) -> Result<Vec<u8>, FeedError> {
        if self.closed {
            return Err(FeedError::Closed(Some("session closed locally".to_string())));
        }

        loop {
            let idle_deadline = deadline(self.last_activity, self.idle_timeout);

            tokio::select! {
                _ = self.ping.tick() => {
                    trace!("sending ping");
                    self.write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| FeedError::Send(e.to_string()))?;
                }
                _ = sleep_until(idle_deadline) => {
                    return Err(FeedError::IdleTimeout(self.idle_timeout));
                }
                frame = self.read.next() => {
                    let Some(frame) = frame else {
                        return Err(FeedError::Closed(None));
                    };
                    let frame = frame.map_err(|e| FeedError::Transport(e.to_string()))?;
                    self.last_activity = Instant::now();

                    match frame {
                        // Upbit delivers JSON in binary frames by default
                        Message::Binary(data) => return Ok(data),
                        Message::Text(text) => return Ok(text.into_bytes()),
                        Message::Ping(payload) => {
                            let _ = self.write.send(Message::Pong(payload)).await;
                        }
                        Message::Pong(_) => {}
                        Message::Close(frame) => {
                            return Err(FeedError::Closed(frame.map(|f| f.reason.to_string())));
                        }
                        Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let shutdown = async {
            let _ = self.write.send(Message::Close(None)).await;
            let _ = self.write.close().await;
        };
        if timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            debug!("websocket close timed out");
        }
    }
}
