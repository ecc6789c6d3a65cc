//! Ingest supervisor.
//!
//! Owns the process lifecycle as an explicit state machine:
//!
//! ```text
//! Disconnected --Start/RetryElapsed--> Connecting --Connected--> Streaming
//!       ^                                  |                        |
//!       +-----------ConnectFailed----------+                        |
//!       +---------------StreamEnded / StorageLost-------------------+
//!
//! any --ShutdownRequested--> Stopped
//! ```
//!
//! Reconnects are unbounded with a fixed delay. A lost storage connection
//! tears the feed down too, and the store is reopened before the next
//! connect attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::feed::{FeedConnector, FeedSession, Subscription};
use crate::pipeline::IngestPipeline;
use crate::recorder::{BookRecorder, StorageLost};
use crate::stats::{IngestStats, StatsSnapshot};
use crate::storage::BookStore;
use crate::throttle::ThrottleGate;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No session. Waiting for the retry delay (or the initial start).
    Disconnected,
    /// Handshake and subscription in progress.
    Connecting,
    /// Session live, messages flowing into the pipeline.
    Streaming,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    Start,
    RetryElapsed,
    Connected,
    ConnectFailed,
    StreamEnded,
    StorageLost,
    ShutdownRequested,
}

impl SupervisorState {
    /// Next state for `event`. Events that do not apply leave the state unchanged.
    pub fn on(self, event: SupervisorEvent) -> SupervisorState {
        use SupervisorEvent as E;
        use SupervisorState as S;

        match (self, event) {
            (S::Stopped, _) => S::Stopped,
            (_, E::ShutdownRequested) => S::Stopped,
            (S::Disconnected, E::Start | E::RetryElapsed) => S::Connecting,
            (S::Connecting, E::Connected) => S::Streaming,
            (S::Connecting, E::ConnectFailed) => S::Disconnected,
            (S::Streaming, E::StreamEnded | E::StorageLost) => S::Disconnected,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SupervisorState::Stopped
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub subscription: Subscription,
    pub retry_delay: Duration,
    pub print_spread: bool,
    pub queue_capacity: usize,
}

impl SupervisorConfig {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            retry_delay: DEFAULT_RETRY_DELAY,
            print_spread: false,
            queue_capacity: 4096,
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

pub struct Supervisor<C: FeedConnector> {
    connector: C,
    config: SupervisorConfig,
    store: Arc<BookStore>,
    pipeline: IngestPipeline,
    storage_lost: mpsc::Receiver<StorageLost>,
    stats: Arc<IngestStats>,
    state_tx: watch::Sender<SupervisorState>,
    shutdown: watch::Receiver<bool>,
}

impl<C: FeedConnector> Supervisor<C> {
    /// Wire the pipeline and spawn the recorder. Must run inside a Tokio runtime.
    pub fn new(
        connector: C,
        config: SupervisorConfig,
        store: Arc<BookStore>,
        gate: Arc<ThrottleGate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let stats = Arc::new(IngestStats::new());
        let (recorder, storage_lost) =
            BookRecorder::spawn(store.clone(), config.queue_capacity, stats.clone());
        let pipeline = IngestPipeline::new(gate, config.print_spread, recorder, stats.clone());
        let (state_tx, _) = watch::channel(SupervisorState::Disconnected);

        Self {
            connector,
            config,
            store,
            pipeline,
            storage_lost,
            stats,
            state_tx,
            shutdown,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Run until shutdown. Returns the final counters.
    pub async fn run(mut self) -> StatsSnapshot {
        info!(
            codes = self.config.subscription.codes.len(),
            retry_delay_secs = self.config.retry_delay.as_secs_f64(),
            store_interval_secs = self.pipeline.gate().interval().as_secs_f64(),
            "🚀 Supervisor starting"
        );

        let mut state = SupervisorState::Disconnected;
        let mut event = SupervisorEvent::Start;
        let mut session: Option<C::Session> = None;
        let mut reopen_pending = false;

        loop {
            let next = state.on(event);
            if next != state {
                info!(from = %state, to = %next, event = ?event, "Supervisor state change");
            }
            if next.is_terminal() {
                if let Some(mut active) = session.take() {
                    active.close().await;
                }
                self.finish().await;
                self.state_tx.send_replace(next);
                break;
            }
            self.state_tx.send_replace(next);
            state = next;

            event = match state {
                SupervisorState::Connecting => match self.connect().await {
                    Ok(Some(active)) => {
                        session = Some(active);
                        SupervisorEvent::Connected
                    }
                    Ok(None) => SupervisorEvent::ConnectFailed,
                    Err(()) => SupervisorEvent::ShutdownRequested,
                },
                SupervisorState::Streaming => {
                    let ended = match session.as_mut() {
                        Some(active) => self.stream(active).await,
                        None => SupervisorEvent::StreamEnded,
                    };
                    if let Some(mut active) = session.take() {
                        active.close().await;
                    }
                    if ended == SupervisorEvent::StorageLost {
                        reopen_pending = true;
                    }
                    ended
                }
                SupervisorState::Disconnected => {
                    info!(stats = %self.stats.snapshot(), "Disconnected");
                    info!(
                        "🔄 Retrying in {:.1} seconds...",
                        self.config.retry_delay.as_secs_f64()
                    );
                    if !self.sleep_or_shutdown(self.config.retry_delay).await {
                        SupervisorEvent::ShutdownRequested
                    } else if reopen_pending && !self.reopen_store().await {
                        // stay disconnected, try again after another delay
                        SupervisorEvent::StorageLost
                    } else {
                        reopen_pending = false;
                        IngestStats::incr(&self.stats.reconnects);
                        SupervisorEvent::RetryElapsed
                    }
                }
                SupervisorState::Stopped => SupervisorEvent::ShutdownRequested,
            };
        }

        let final_stats = self.stats.snapshot();
        info!(stats = %final_stats, "🛑 Supervisor stopped");
        final_stats
    }

    /// `Err(())` when shutdown interrupted the attempt.
    async fn connect(&mut self) -> Result<Option<C::Session>, ()> {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => Err(()),
            result = self.connector.connect(&self.config.subscription) => match result {
                Ok(active) => Ok(Some(active)),
                Err(e) => {
                    warn!(error = %e, "Feed connect failed");
                    Ok(None)
                }
            },
        }
    }

    async fn stream(&mut self, session: &mut C::Session) -> SupervisorEvent {
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    return SupervisorEvent::ShutdownRequested;
                }
                Some(fault) = self.storage_lost.recv() => {
                    if fault.is_stale(self.store.generation()) {
                        debug!(reason = %fault.reason, generation = fault.generation, "Ignoring fault from replaced store connection");
                        continue;
                    }
                    error!(reason = %fault.reason, "Storage connection lost, restarting");
                    return SupervisorEvent::StorageLost;
                }
                frame = session.recv() => match frame {
                    Ok(raw) => {
                        self.pipeline.process(&raw, Instant::now());
                    }
                    Err(e) => {
                        warn!(error = %e, "Feed session ended");
                        return SupervisorEvent::StreamEnded;
                    }
                },
            }
        }
    }

    /// `false` when shutdown arrived first.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn reopen_store(&mut self) -> bool {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.reopen()).await;

        let reopened = match result {
            Ok(Ok(())) => {
                IngestStats::incr(&self.stats.store_reopens);
                // Faults raised against the old connection are stale now
                while self.storage_lost.try_recv().is_ok() {}
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to reopen order-book store");
                false
            }
            Err(e) => {
                error!(error = %e, "Store reopen task failed");
                false
            }
        };
        if !reopened {
            IngestStats::incr(&self.stats.reopen_failures);
        }
        reopened
    }

    async fn finish(&mut self) {
        info!("Shutting down: draining recorder queue");
        self.pipeline.shutdown().await;

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to close order-book store"),
            Err(e) => warn!(error = %e, "Store close task failed"),
        }
    }
}
