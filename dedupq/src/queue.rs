//! UniQueue: deduplicating dispatch queue with a non-blocking insert.
//!
//! Flow: `insert` → intake channel (capacity `max_inflight`) → transfer task →
//! output channel (capacity `output_buffer`) → consumers via [`WorkStream`].
//!
//! `inflight` counts items that entered the intake and have not yet been
//! handed to the output channel. `insert` only writes to the intake after
//! seeing `inflight < max_inflight`, so the write always finds a free slot and
//! never waits on consumers. Slow consumers show up as `QueueFull` once the
//! output buffer and the intake are both full.
//!
//! Shutdown (token cancelled or `close()`):
//! 1. Under the lock: mark closing, drop the intake sender. Inserts now fail.
//! 2. Transfer task stops, discards whatever is left in the intake, drops the
//!    output sender.
//! 3. Undelivered output is discarded and the queue reports `Closed`.
//!
//! The dedup sweeper runs every `dedup_window` and exits on the same token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheError;
use crate::config::{ConfigError, QueueConfig};
use crate::ticker::ticker_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("this key already exists")]
    AlreadyExists,
    #[error("could not insert, the cache is full")]
    CacheFull,
    #[error("the queue is full, nothing can be inserted until consumers catch up")]
    QueueFull,
    #[error("this uniqueue is closed")]
    Closed,
}

impl QueueError {
    /// Terminal: the caller must stop submitting.
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }

    /// Transient backpressure: the same item may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::QueueFull)
    }
}

impl From<CacheError> for QueueError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::AlreadyExists => QueueError::AlreadyExists,
            CacheError::CacheFull => QueueError::CacheFull,
        }
    }
}

/// Producer/consumer contract of a non-blocking work queue.
pub trait WorkQueue: Send + Sync {
    /// Submit an item without waiting. Rejections are returned, never awaited.
    fn insert(&self, item: String) -> Result<(), QueueError>;

    /// Consumer handle for the queue's output.
    fn get_chan(&self) -> Result<WorkStream, QueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open,
    /// Closed to inserts, internal stages still draining.
    Closing,
    Closed,
}

/// Read side of a stream of work items.
///
/// Clones share one receiver: every item is delivered to exactly one reader.
/// `recv` yields `None` once the stream is closed and empty.
#[derive(Clone)]
pub struct WorkStream {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    discard: Option<Arc<AtomicBool>>,
}

impl WorkStream {
    pub async fn recv(&self) -> Option<String> {
        let mut rx = self.rx.lock().await;
        loop {
            let item = rx.recv().await?;
            // Items still buffered when the owning queue closed are dropped.
            if self.discarding() {
                continue;
            }
            return Some(item);
        }
    }

    fn discarding(&self) -> bool {
        self.discard
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

impl From<mpsc::Receiver<String>> for WorkStream {
    fn from(rx: mpsc::Receiver<String>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
            discard: None,
        }
    }
}

struct Shared {
    dedup: HashMap<String, Instant>,
    /// `None` once closing has begun.
    intake: Option<mpsc::Sender<String>>,
}

struct Inner {
    name: String,
    dedup_window: Duration,
    max_dedup: usize,
    max_inflight: usize,
    shared: RwLock<Shared>,
    /// Mirrors `dedup.len()`; written only under the write lock.
    records: AtomicUsize,
    inflight: AtomicUsize,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
    drained: CancellationToken,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(|poisoned| {
            tracing::error!(queue = %self.name, "Queue lock poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(|poisoned| {
            tracing::error!(queue = %self.name, "Queue lock poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Stop accepting inserts. Safe to call more than once.
    fn begin_close(&self) {
        let mut shared = self.write();
        self.closing.store(true, Ordering::Release);
        if shared.intake.take().is_some() {
            tracing::debug!(queue = %self.name, "UniQueue closing");
        }
    }

    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut shared = self.write();
        let before = shared.dedup.len();
        shared.dedup.retain(|_, expires_at| *expires_at > now);
        self.records.store(shared.dedup.len(), Ordering::Release);
        before - shared.dedup.len()
    }

    fn insert(&self, item: String) -> Result<(), QueueError> {
        // Fast path. Racy on purpose; everything is checked again under the
        // write lock before any state changes.
        if self.is_closing() {
            return Err(QueueError::Closed);
        }
        if self.read().dedup.contains_key(&item) {
            return Err(QueueError::AlreadyExists);
        }
        if self.records.load(Ordering::Acquire) >= self.max_dedup {
            return Err(QueueError::CacheFull);
        }

        let mut shared = self.write();
        if self.is_closing() {
            return Err(QueueError::Closed);
        }
        let Some(intake) = shared.intake.clone() else {
            return Err(QueueError::Closed);
        };
        if shared.dedup.contains_key(&item) {
            return Err(QueueError::AlreadyExists);
        }
        if shared.dedup.len() >= self.max_dedup {
            return Err(QueueError::CacheFull);
        }
        if self.inflight.load(Ordering::Acquire) >= self.max_inflight {
            return Err(QueueError::QueueFull);
        }

        self.inflight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = intake.try_send(item.clone()) {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(queue = %self.name, "Intake full below max_inflight");
                    QueueError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            });
        }

        shared.dedup.insert(item, Instant::now() + self.dedup_window);
        self.records.store(shared.dedup.len(), Ordering::Release);
        Ok(())
    }
}

/// Deduplicating dispatch queue.
///
/// An item is admitted at most once per `dedup_window`, at most `max_dedup`
/// distinct items are tracked at a time, and at most `max_inflight` admitted
/// items wait in the transfer stage. `insert` never waits.
///
/// Must be created inside a tokio runtime. Dropping the queue closes it.
pub struct UniQueue {
    inner: Arc<Inner>,
    output: WorkStream,
}

impl UniQueue {
    pub fn new(config: QueueConfig, parent: &CancellationToken) -> Result<Self, ConfigError> {
        config.validate()?;

        let (intake_tx, intake_rx) = mpsc::channel(config.max_inflight);
        let (output_tx, output_rx) = mpsc::channel(config.output_buffer);
        let closing = Arc::new(AtomicBool::new(false));
        let cancel = parent.child_token();

        let inner = Arc::new(Inner {
            name: config.name,
            dedup_window: config.dedup_window,
            max_dedup: config.max_dedup,
            max_inflight: config.max_inflight,
            shared: RwLock::new(Shared {
                dedup: HashMap::new(),
                intake: Some(intake_tx),
            }),
            records: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            closing: Arc::clone(&closing),
            cancel: cancel.clone(),
            drained: CancellationToken::new(),
        });
        let output = WorkStream {
            rx: Arc::new(Mutex::new(output_rx)),
            discard: Some(closing),
        };

        tokio::spawn(sweep_loop(Arc::clone(&inner)));
        let transfer = tokio::spawn(transfer_loop(Arc::clone(&inner), intake_rx, output_tx));
        tokio::spawn(shutdown(Arc::clone(&inner), transfer, output.clone()));

        let logged = Arc::clone(&inner);
        ticker_log(config.log_interval, cancel, move || {
            tracing::info!(
                queue = %logged.name,
                inflight = logged.inflight.load(Ordering::Relaxed),
                records = logged.records.load(Ordering::Relaxed),
                "{} UniQueue has {} records inflight",
                logged.name,
                logged.inflight.load(Ordering::Relaxed)
            );
        });

        Ok(Self { inner, output })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether `item` is inside its dedup window.
    pub fn check(&self, item: &str) -> bool {
        self.inner.read().dedup.contains_key(item)
    }

    /// Drop an item's dedup entry early so it can be admitted again.
    /// Returns whether an entry was removed.
    pub fn uncache(&self, item: &str) -> bool {
        let mut shared = self.inner.write();
        let removed = shared.dedup.remove(item).is_some();
        self.inner
            .records
            .store(shared.dedup.len(), Ordering::Release);
        removed
    }

    /// Distinct items currently deduplicated.
    pub fn records(&self) -> usize {
        self.inner.records.load(Ordering::Acquire)
    }

    /// Admitted items not yet handed to the output.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    pub fn state(&self) -> QueueState {
        if self.inner.drained.is_cancelled() {
            QueueState::Closed
        } else if self.inner.is_closing() {
            QueueState::Closing
        } else {
            QueueState::Open
        }
    }

    /// Begin shutdown. Idempotent; use [`UniQueue::closed`] to wait for the
    /// drain to finish.
    pub fn close(&self) {
        self.inner.begin_close();
        self.inner.cancel.cancel();
    }

    /// Wait until shutdown has fully drained the queue.
    pub async fn closed(&self) {
        self.inner.drained.cancelled().await;
    }
}

impl WorkQueue for UniQueue {
    fn insert(&self, item: String) -> Result<(), QueueError> {
        self.inner.insert(item)
    }

    fn get_chan(&self) -> Result<WorkStream, QueueError> {
        if self.inner.is_closing() {
            return Err(QueueError::Closed);
        }
        Ok(self.output.clone())
    }
}

impl Drop for UniQueue {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn sweep_loop(inner: Arc<Inner>) {
    let window = inner.dedup_window;
    let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = inner.evict_expired();
                if evicted > 0 {
                    tracing::debug!(queue = %inner.name, evicted, "Dedup entries expired");
                }
            }
        }
    }
}

/// Move items from the intake to the output, counting them out of `inflight`.
/// Returns how many items were discarded at shutdown.
async fn transfer_loop(
    inner: Arc<Inner>,
    mut intake: mpsc::Receiver<String>,
    output: mpsc::Sender<String>,
) -> usize {
    let mut discarded = 0;
    loop {
        let item = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            item = intake.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
                discarded += 1;
                break;
            }
            sent = output.send(item) => {
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    intake.close();
    while intake.try_recv().is_ok() {
        inner.inflight.fetch_sub(1, Ordering::AcqRel);
        discarded += 1;
    }
    discarded
}

async fn shutdown(
    inner: Arc<Inner>,
    transfer: tokio::task::JoinHandle<usize>,
    output: WorkStream,
) {
    inner.cancel.cancelled().await;
    inner.begin_close();

    let mut discarded = match transfer.await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(queue = %inner.name, error = %e, "Transfer task failed");
            0
        }
    };

    // A consumer parked in `recv` holds the lock; it drops leftovers itself.
    if let Ok(mut rx) = output.rx.try_lock() {
        rx.close();
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
    }

    inner.drained.cancel();
    tracing::debug!(queue = %inner.name, discarded, "UniQueue closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_dedup: usize, max_inflight: usize, window: Duration) -> UniQueue {
        UniQueue::new(
            QueueConfig::new(max_dedup, max_inflight, window).with_name("test"),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    fn insert(q: &UniQueue, item: &str) -> Result<(), QueueError> {
        q.insert(item.to_string())
    }

    /// Let the transfer task catch up.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let result = UniQueue::new(
            QueueConfig::new(3, 0, Duration::from_secs(1)),
            &CancellationToken::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_and_capacity_scenario() {
        let q = queue(3, 3, Duration::from_secs(1));

        assert!(insert(&q, "a").is_ok());
        assert!(insert(&q, "b").is_ok());
        assert!(insert(&q, "c").is_ok());
        assert_eq!(q.records(), 3);

        assert_eq!(insert(&q, "d"), Err(QueueError::CacheFull));
        assert_eq!(insert(&q, "a"), Err(QueueError::AlreadyExists));

        // One window plus one sweep.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(q.records(), 0);
        assert!(insert(&q, "a").is_ok());
        assert_eq!(q.records(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_bound_and_release_on_read() {
        let q = UniQueue::new(
            QueueConfig::new(100, 2, Duration::from_secs(60)).with_output_buffer(1),
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(insert(&q, "x1").is_ok());
        assert!(insert(&q, "x2").is_ok());
        assert_eq!(insert(&q, "x3"), Err(QueueError::QueueFull));
        assert_eq!(q.inflight(), 2);

        // x1 moves into the output buffer, x2 waits in the transfer stage.
        settle().await;
        assert_eq!(q.inflight(), 1);
        assert!(insert(&q, "x3").is_ok());
        assert_eq!(insert(&q, "x4"), Err(QueueError::QueueFull));

        // Nothing drains without a reader, and insert keeps returning at once.
        settle().await;
        for _ in 0..1000 {
            assert_eq!(insert(&q, "x4"), Err(QueueError::QueueFull));
        }

        let rx = q.get_chan().unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("x1"));
        settle().await;
        assert_eq!(q.inflight(), 1);
        assert!(insert(&q, "x4").is_ok());

        // Rejected items leave no dedup entry behind.
        assert_eq!(q.records(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_absorbed_by_output_buffer() {
        let q = queue(12, 3, Duration::from_secs(1));

        let batches: [&[&str]; 3] = [&["a", "b", "c"], &["d", "e", "f"], &["g", "h"]];
        for batch in batches {
            for &item in batch {
                assert!(insert(&q, item).is_ok(), "insert {item} failed");
            }
            settle().await;
        }
        for item in ["i", "j", "k"] {
            assert!(insert(&q, item).is_ok(), "insert {item} failed");
        }
        assert_eq!(insert(&q, "a"), Err(QueueError::AlreadyExists));
        assert_eq!(insert(&q, "l"), Err(QueueError::QueueFull));
        assert_eq!(q.records(), 11);
        assert_eq!(q.inflight(), 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(insert(&q, "a"), Err(QueueError::QueueFull));
        assert_eq!(q.records(), 0);

        let rx = q.get_chan().unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        settle().await;
        assert!(insert(&q, "a").is_ok());
    }

    #[tokio::test]
    async fn check_and_uncache() {
        let q = queue(3, 3, Duration::from_secs(60));

        assert!(insert(&q, "a").is_ok());
        assert!(q.check("a"));
        assert!(!q.check("b"));

        assert!(q.uncache("a"));
        assert!(!q.check("a"));
        assert_eq!(q.records(), 0);

        // Missing keys leave the count alone.
        assert!(!q.uncache("a"));
        assert!(!q.uncache("never"));
        assert_eq!(q.records(), 0);

        assert!(insert(&q, "a").is_ok());
        assert_eq!(q.records(), 1);
    }

    #[tokio::test]
    async fn output_preserves_admission_order() {
        let q = queue(10, 10, Duration::from_secs(60));
        for item in ["a", "b", "c", "d"] {
            insert(&q, item).unwrap();
        }

        let rx = q.get_chan().unwrap();
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(rx.recv().await.unwrap());
        }
        assert_eq!(got, ["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn close_rejects_and_drains() {
        let q = queue(10, 3, Duration::from_secs(60));
        let rx = q.get_chan().unwrap();
        for item in ["a", "b", "c"] {
            insert(&q, item).unwrap();
        }

        q.close();
        assert_eq!(insert(&q, "z"), Err(QueueError::Closed));
        assert_ne!(q.state(), QueueState::Open);

        tokio::time::timeout(Duration::from_secs(1), q.closed())
            .await
            .expect("queue did not finish draining");
        assert_eq!(q.state(), QueueState::Closed);
        assert_eq!(q.inflight(), 0);
        assert_eq!(rx.recv().await, None);
        assert!(matches!(q.get_chan(), Err(QueueError::Closed)));

        // Second close is a no-op.
        q.close();
        q.closed().await;
        assert_eq!(insert(&q, "a"), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn parent_cancel_closes() {
        let parent = CancellationToken::new();
        let q = UniQueue::new(QueueConfig::new(3, 3, Duration::from_secs(1)), &parent).unwrap();

        parent.cancel();
        assert_eq!(insert(&q, "a"), Err(QueueError::Closed));
        tokio::time::timeout(Duration::from_secs(1), q.closed())
            .await
            .expect("queue did not close on parent cancel");
        assert_eq!(q.state(), QueueState::Closed);
    }

    #[tokio::test]
    async fn parked_consumer_released_on_close() {
        let q = queue(10, 3, Duration::from_secs(60));
        let rx = q.get_chan().unwrap();

        let reader = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        q.close();
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader stayed parked after close")
            .unwrap();
        assert_eq!(got, None);
        q.closed().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_inserts_admit_once() {
        let q = Arc::new(queue(100, 100, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move { q.insert("same".to_string()) }));
        }

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(e) => assert_eq!(e, QueueError::AlreadyExists),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(q.records(), 1);
    }

    #[test]
    fn error_classification() {
        assert!(QueueError::Closed.is_closed());
        assert!(QueueError::QueueFull.is_retryable());
        assert!(!QueueError::CacheFull.is_retryable());
        assert_eq!(QueueError::from(CacheError::CacheFull), QueueError::CacheFull);
        assert_eq!(
            QueueError::from(CacheError::AlreadyExists),
            QueueError::AlreadyExists
        );
    }
}
