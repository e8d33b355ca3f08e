//! Worker pool fed by a deduplicating queue.
//!
//! Every worker reads from the same [`UniQueue`] output, so each admitted item
//! runs on exactly one worker. Submissions never block and an item is not run
//! twice within the queue's dedup window.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::{ConfigError, PoolConfig};
use crate::queue::{QueueError, UniQueue, WorkQueue};
use crate::worker::{SideEffect, SideEffectWorker, WorkerError};

/// Non-blocking submission side of a pool.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Hand an item to the pool without waiting.
    fn submit(&self, item: String) -> Result<(), QueueError>;

    /// Stop the pool and wait for every worker to finish. Idempotent.
    async fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),
    #[error("worker unavailable: {0}")]
    Worker(#[from] WorkerError),
}

pub struct DedupWorkerPool {
    queue: Arc<UniQueue>,
    workers: Vec<SideEffectWorker>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    queue_cancel: CancellationToken,
}

impl DedupWorkerPool {
    /// Build a pool of `workers` workers draining `queue`.
    ///
    /// `queue_cancel` is the token `queue` was built on; the pool cancels it
    /// first when closing. Workers run on a child of `parent`, and that token
    /// is also what the side effect receives.
    pub fn new<S: SideEffect>(
        workers: usize,
        queue: Arc<UniQueue>,
        side_effect: S,
        parent: &CancellationToken,
        queue_cancel: CancellationToken,
    ) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1").into());
        }

        let output = queue.get_chan()?;
        let side_effect: Arc<dyn SideEffect> = Arc::new(side_effect);
        let cancel = parent.child_token();
        let tracker = TaskTracker::new();

        let workers = (0..workers)
            .map(|_| {
                let worker = SideEffectWorker::new(&cancel, &tracker, Arc::clone(&side_effect));
                worker.set_work_chan(output.clone())?;
                Ok(worker)
            })
            .collect::<Result<Vec<_>, WorkerError>>()?;

        tracing::debug!(queue = %queue.name(), workers = workers.len(), "Worker pool started");

        Ok(Self {
            queue,
            workers,
            tracker,
            cancel,
            queue_cancel,
        })
    }

    /// Build the queue and the pool together. The queue runs on its own child
    /// of `parent`, controlled by the pool.
    pub fn from_config<S: SideEffect>(
        config: PoolConfig,
        side_effect: S,
        parent: &CancellationToken,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let queue_cancel = parent.child_token();
        let queue = Arc::new(UniQueue::new(config.queue, &queue_cancel)?);
        Self::new(config.workers, queue, side_effect, parent, queue_cancel)
    }

    pub fn queue(&self) -> &Arc<UniQueue> {
        &self.queue
    }

    pub fn worker_ids(&self) -> Vec<Uuid> {
        self.workers.iter().map(SideEffectWorker::id).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl WorkerPool for DedupWorkerPool {
    fn submit(&self, item: String) -> Result<(), QueueError> {
        self.queue.insert(item)
    }

    async fn close(&self) {
        // Queue first: stop admitting and let its output close, so workers
        // see their sources end instead of being cut off mid-stream.
        self.queue_cancel.cancel();
        self.queue.close();
        self.cancel.cancel();

        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(queue = %self.queue.name(), "Worker pool closed");
    }
}

impl Drop for DedupWorkerPool {
    fn drop(&mut self) {
        self.queue_cancel.cancel();
        self.cancel.cancel();
    }
}
