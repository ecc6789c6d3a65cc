//! Supervisor lifecycle against a scripted feed.
//!
//! Each `connect` hands out the next pre-loaded session; the test pushes
//! frames (or a terminal error) into that session's channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use book_ingest::feed::{FeedConnector, FeedError, FeedSession, Subscription};
use book_ingest::storage::BookStore;
use book_ingest::supervisor::{Supervisor, SupervisorConfig, SupervisorState};
use book_ingest::throttle::ThrottleGate;

type Script = mpsc::UnboundedReceiver<Result<Vec<u8>, FeedError>>;
type ScriptTx = mpsc::UnboundedSender<Result<Vec<u8>, FeedError>>;

const RETRY: Duration = Duration::from_millis(200);

// =============================================================================
// SCRIPTED FEED
// =============================================================================

#[derive(Default)]
struct FeedLog {
    connects: Mutex<Vec<(Instant, Subscription)>>,
    closes: Mutex<Vec<Instant>>,
    open: AtomicUsize,
    max_open: AtomicUsize,
    /// Whether the watched store was open at each successful connect.
    store_open_on_connect: Mutex<Vec<bool>>,
}

struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    log: Arc<FeedLog>,
    watched_store: Option<Arc<BookStore>>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Script>) -> (Self, Arc<FeedLog>) {
        let log = Arc::new(FeedLog::default());
        (
            Self {
                scripts: Mutex::new(scripts.into()),
                log: log.clone(),
                watched_store: None,
            },
            log,
        )
    }

    fn watching(mut self, store: Arc<BookStore>) -> Self {
        self.watched_store = Some(store);
        self
    }
}

#[async_trait]
impl FeedConnector for ScriptedConnector {
    type Session = ScriptedSession;

    async fn connect(&self, subscription: &Subscription) -> Result<ScriptedSession, FeedError> {
        let Some(script) = self.scripts.lock().pop_front() else {
            return Err(FeedError::Connect("no scripted session left".to_string()));
        };

        self.log
            .connects
            .lock()
            .push((Instant::now(), subscription.clone()));
        if let Some(store) = &self.watched_store {
            self.log.store_open_on_connect.lock().push(store.is_open());
        }
        let open = self.log.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_open.fetch_max(open, Ordering::SeqCst);

        Ok(ScriptedSession {
            script,
            log: self.log.clone(),
            closed: false,
        })
    }
}

struct ScriptedSession {
    script: Script,
    log: Arc<FeedLog>,
    closed: bool,
}

#[async_trait]
impl FeedSession for ScriptedSession {
    async fn recv(&mut self) -> Result<Vec<u8>, FeedError> {
        match self.script.recv().await {
            Some(frame) => frame,
            None => Err(FeedError::Closed(None)),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.open.fetch_sub(1, Ordering::SeqCst);
            self.log.closes.lock().push(Instant::now());
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn book(code: &str, ts: i64) -> Vec<u8> {
    serde_json::json!({
        "type": "orderbook",
        "code": code,
        "timestamp": ts,
        "total_ask_size": 3.0,
        "total_bid_size": 4.0,
        "stream_type": "REALTIME",
        "orderbook_units": [
            {"ask_price": 101.0, "bid_price": 100.0, "ask_size": 1.0, "bid_size": 2.0},
            {"ask_price": 102.0, "bid_price": 99.0, "ask_size": 2.0, "bid_size": 2.0}
        ]
    })
    .to_string()
    .into_bytes()
}

fn script() -> (ScriptTx, Script) {
    mpsc::unbounded_channel()
}

fn config(codes: &[&str]) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(Subscription::orderbook(
        "dnk",
        codes.iter().map(|c| c.to_string()).collect(),
    ));
    config.retry_delay = RETRY;
    config
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn snapshots(store: &BookStore, code: &str) -> u64 {
    store.snapshot_count(code).unwrap_or(0)
}

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn test_reconnects_after_remote_close_and_resumes() {
    let store = Arc::new(BookStore::open_memory().unwrap());
    let (tx1, rx1) = script();
    let (tx2, rx2) = script();
    let (connector, log) = ScriptedConnector::new(vec![rx1, rx2]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tx1.send(Ok(book("KRW-BTC", 1))).unwrap();
    tx1.send(Err(FeedError::Closed(Some("server restart".to_string()))))
        .unwrap();
    tx2.send(Ok(book("KRW-BTC", 2))).unwrap();

    let supervisor = Supervisor::new(
        connector,
        config(&["KRW-BTC", "KRW-ETH"]),
        store.clone(),
        Arc::new(ThrottleGate::new(Duration::ZERO)),
        shutdown_rx,
    );
    let mut state = supervisor.subscribe_state();
    let stats = supervisor.stats();
    let handle = tokio::spawn(supervisor.run());

    eventually("second snapshot", || snapshots(&store, "KRW-BTC") == 2).await;
    assert_eq!(store.snapshot_timestamps("KRW-BTC").unwrap(), vec![1, 2]);

    {
        let connects = log.connects.lock();
        let closes = log.closes.lock();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[0].1, connects[1].1, "resubscribes with the same list");
        assert_eq!(connects[1].1.codes, vec!["KRW-BTC", "KRW-ETH"]);
        assert!(connects[1].0.duration_since(closes[0]) >= RETRY);
    }
    assert_eq!(log.max_open.load(Ordering::SeqCst), 1);
    assert_eq!(stats.snapshot().reconnects, 1);

    shutdown_tx.send(true).unwrap();
    let final_stats = handle.await.unwrap();
    assert_eq!(*state.borrow_and_update(), SupervisorState::Stopped);
    assert_eq!(final_stats.stored, 2);
    assert_eq!(log.open.load(Ordering::SeqCst), 0);
    assert!(!store.is_open());
    drop(tx2);
}

#[tokio::test]
async fn test_failed_connects_retry_without_giving_up() {
    let store = Arc::new(BookStore::open_memory().unwrap());
    // No sessions scripted: every connect fails
    let (connector, _log) = ScriptedConnector::new(Vec::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(
        connector,
        config(&["KRW-BTC"]),
        store,
        Arc::new(ThrottleGate::new(Duration::ZERO)),
        shutdown_rx,
    );
    let stats = supervisor.stats();
    let handle = tokio::spawn(supervisor.run());

    eventually("three retries", || stats.snapshot().reconnects >= 3).await;
    assert!(!handle.is_finished());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_storage_loss_restarts_feed_and_reopens_store() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("book.db").to_string_lossy().to_string();
    let store = Arc::new(BookStore::open(&db_path).unwrap());

    let (tx1, rx1) = script();
    let (tx2, rx2) = script();
    let (connector, log) = ScriptedConnector::new(vec![rx1, rx2]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tx1.send(Ok(book("KRW-BTC", 1))).unwrap();
    tx2.send(Ok(book("KRW-BTC", 3))).unwrap();

    let supervisor = Supervisor::new(
        connector,
        config(&["KRW-BTC"]),
        store.clone(),
        Arc::new(ThrottleGate::new(Duration::ZERO)),
        shutdown_rx,
    );
    let stats = supervisor.stats();
    let handle = tokio::spawn(supervisor.run());

    eventually("first snapshot", || snapshots(&store, "KRW-BTC") == 1).await;

    store.close().unwrap();
    tx1.send(Ok(book("KRW-BTC", 2))).unwrap();

    eventually("snapshot after reopen", || {
        store.is_open() && snapshots(&store, "KRW-BTC") == 2
    })
    .await;

    assert_eq!(store.snapshot_timestamps("KRW-BTC").unwrap(), vec![1, 3]);
    assert_eq!(log.connects.lock().len(), 2);
    assert_eq!(log.max_open.load(Ordering::SeqCst), 1);
    assert_eq!(stats.snapshot().store_failures, 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_failed_reopen_waits_another_delay_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().join("data");
    let db_path = db_dir.join("book.db").to_string_lossy().to_string();
    let store = Arc::new(BookStore::open(&db_path).unwrap());

    let (tx1, rx1) = script();
    let (tx2, rx2) = script();
    let (connector, log) = ScriptedConnector::new(vec![rx1, rx2]);
    let connector = connector.watching(store.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tx1.send(Ok(book("KRW-BTC", 1))).unwrap();
    tx2.send(Ok(book("KRW-BTC", 3))).unwrap();

    let retry = Duration::from_millis(400);
    let mut config = config(&["KRW-BTC"]);
    config.retry_delay = retry;
    let supervisor = Supervisor::new(
        connector,
        config,
        store.clone(),
        Arc::new(ThrottleGate::new(Duration::ZERO)),
        shutdown_rx,
    );
    let stats = supervisor.stats();
    let handle = tokio::spawn(supervisor.run());

    eventually("first snapshot", || snapshots(&store, "KRW-BTC") == 1).await;

    // Lose the connection and take the directory away so the reopen fails
    store.close().unwrap();
    std::fs::remove_dir_all(&db_dir).unwrap();
    tx1.send(Ok(book("KRW-BTC", 2))).unwrap();

    eventually("failed reopen", || stats.snapshot().reopen_failures >= 1).await;
    assert!(!store.is_open());
    assert_eq!(log.connects.lock().len(), 1, "no connect before the store is back");

    std::fs::create_dir_all(&db_dir).unwrap();
    eventually("snapshot after reopen", || {
        store.is_open() && snapshots(&store, "KRW-BTC") == 1
    })
    .await;

    // The directory was recreated empty, so only the post-reopen update is there
    assert_eq!(store.snapshot_timestamps("KRW-BTC").unwrap(), vec![3]);
    {
        let connects = log.connects.lock();
        let closes = log.closes.lock();
        assert_eq!(connects.len(), 2);
        assert!(connects[1].0.duration_since(closes[0]) >= retry * 2);
    }
    assert_eq!(*log.store_open_on_connect.lock(), vec![true, true]);
    let snap = stats.snapshot();
    assert_eq!(snap.store_reopens, 1);
    assert!(snap.reopen_failures >= 1);
    assert_eq!(snap.reconnects, 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    drop(tx2);
}

#[tokio::test]
async fn test_shutdown_while_waiting_to_retry() {
    let store = Arc::new(BookStore::open_memory().unwrap());
    let (connector, _log) = ScriptedConnector::new(Vec::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut config = config(&["KRW-BTC"]);
    config.retry_delay = Duration::from_secs(60);
    let supervisor = Supervisor::new(
        connector,
        config,
        store.clone(),
        Arc::new(ThrottleGate::new(Duration::ZERO)),
        shutdown_rx,
    );
    let mut state = supervisor.subscribe_state();
    let handle = tokio::spawn(supervisor.run());

    // first connect fails at once, leaving a 60s retry wait
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*state.borrow_and_update(), SupervisorState::Disconnected);

    let started = Instant::now();
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(*state.borrow(), SupervisorState::Stopped);
    assert!(!store.is_open());
}

#[tokio::test]
async fn test_garbage_frames_do_not_end_the_session() {
    let store = Arc::new(BookStore::open_memory().unwrap());
    let (tx1, rx1) = script();
    let (connector, log) = ScriptedConnector::new(vec![rx1]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tx1.send(Ok(b"not json".to_vec())).unwrap();
    tx1.send(Ok(br#"{"type":"ticker","code":"KRW-BTC"}"#.to_vec()))
        .unwrap();
    tx1.send(Ok(book("KRW-XRP", 7))).unwrap();

    let supervisor = Supervisor::new(
        connector,
        config(&["KRW-XRP"]),
        store.clone(),
        Arc::new(ThrottleGate::new(Duration::from_secs(1))),
        shutdown_rx,
    );
    let stats = supervisor.stats();
    let handle = tokio::spawn(supervisor.run());

    eventually("xrp snapshot", || snapshots(&store, "KRW-XRP") == 1).await;
    assert_eq!(stats.snapshot().rejected, 2);
    assert_eq!(log.connects.lock().len(), 1);
    assert_eq!(store.instrument_count("KRW-BTC").unwrap(), 0);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    drop(tx1);
}
