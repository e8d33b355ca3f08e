//! Side-effect workers.
//!
//! A worker owns one internal input channel and runs the side-effect function
//! on every item it receives. Any number of [`WorkStream`]s can be attached
//! with `set_work_chan`; each gets a forwarder task feeding the internal input.
//!
//! Shutdown order on cancellation:
//! 1. No further sources may be attached.
//! 2. Wait for every attached source to close and drain.
//! 3. Close the internal input; the consume loop finishes what is buffered.
//!
//! Closing the input before the sources drain would leave forwarders writing
//! into a torn-down channel.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::queue::WorkStream;

/// Capacity of a worker's internal input.
pub const WORKER_BUFFER: usize = 1;

/// Work done per item. Results are the implementation's own business: there
/// is no return value, so failures must be reported out of band.
///
/// The token is the worker's cancellation token; long-running work should
/// watch it and return early.
#[async_trait]
pub trait SideEffect: Send + Sync + 'static {
    async fn run(&self, item: String, cancel: CancellationToken);
}

#[async_trait]
impl<F, Fut> SideEffect for F
where
    F: Fn(String, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self, item: String, cancel: CancellationToken) {
        (self)(item, cancel).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is closed")]
    Closed,
}

/// Registry of input sources feeding one internal channel.
struct Mux {
    closed: AtomicBool,
    /// The worker's own handle on the internal input. Forwarders hold clones;
    /// the channel closes once this one is dropped and every forwarder is done.
    incoming: StdMutex<Option<mpsc::Sender<String>>>,
    sources: TaskTracker,
}

impl Mux {
    fn incoming(&self) -> MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.incoming.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Worker input lock poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }
}

pub struct SideEffectWorker {
    id: Uuid,
    cancel: CancellationToken,
    mux: Arc<Mux>,
}

impl SideEffectWorker {
    /// Start a worker. Its consume loop and shutdown watcher are spawned on
    /// `tracker`, which therefore only completes once the worker has stopped.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        cancel: &CancellationToken,
        tracker: &TaskTracker,
        side_effect: Arc<dyn SideEffect>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(WORKER_BUFFER);
        let mux = Arc::new(Mux {
            closed: AtomicBool::new(false),
            incoming: StdMutex::new(Some(tx)),
            sources: TaskTracker::new(),
        });

        tracker.spawn(consume(id, rx, side_effect, cancel.clone()));
        tracker.spawn(shutdown(id, Arc::clone(&mux), cancel.clone()));

        Self {
            id,
            cancel: cancel.clone(),
            mux,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attach another input source. Fails once shutdown has begun.
    pub fn set_work_chan(&self, source: WorkStream) -> Result<(), WorkerError> {
        // Hold the input lock so shutdown cannot start between the check and
        // the registration.
        let incoming = self.mux.incoming();
        if self.is_closed() {
            return Err(WorkerError::Closed);
        }
        let Some(tx) = incoming.as_ref().cloned() else {
            return Err(WorkerError::Closed);
        };

        self.mux.sources.spawn(forward(source, tx));
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.mux.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }
}

async fn forward(source: WorkStream, incoming: mpsc::Sender<String>) {
    while let Some(item) = source.recv().await {
        if incoming.send(item).await.is_err() {
            break;
        }
    }
}

async fn consume(
    id: Uuid,
    mut rx: mpsc::Receiver<String>,
    side_effect: Arc<dyn SideEffect>,
    cancel: CancellationToken,
) {
    while let Some(item) = rx.recv().await {
        side_effect.run(item, cancel.clone()).await;
    }
    tracing::debug!(worker = %id, "Worker stopped");
}

async fn shutdown(id: Uuid, mux: Arc<Mux>, cancel: CancellationToken) {
    cancel.cancelled().await;
    {
        let _incoming = mux.incoming();
        mux.closed.store(true, Ordering::Release);
    }

    mux.sources.close();
    if !mux.sources.is_empty() {
        tracing::debug!(worker = %id, sources = mux.sources.len(), "Waiting for worker sources to drain");
    }
    mux.sources.wait().await;

    drop(mux.incoming().take());
}
