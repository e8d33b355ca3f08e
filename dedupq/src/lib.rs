//! dedupq: non-blocking work dispatch with deduplication.
//!
//! Producers hand string items to a [`UniQueue`] without ever blocking: an
//! item is either admitted or rejected immediately with a [`QueueError`]
//! saying why. An admitted item is remembered for the queue's dedup window,
//! so resubmitting it inside the window is rejected. A [`DedupWorkerPool`]
//! drains the queue across a fixed set of [`SideEffectWorker`]s, each item
//! running on exactly one of them.
//!
//! Building blocks:
//! - [`TtlCache`]: capacity-bounded expiring key set (optionally with values).
//! - [`Semaphore`] / [`RateLimiter`]: bounded permits, optionally per-second.
//! - [`ticker_log`]: periodic callbacks bound to a cancellation token.
//!
//! Everything long-lived hangs off a [`CancellationToken`]. Cancelling the
//! parent token shuts the whole tree down; `close` methods do the same for a
//! single component and are idempotent.

pub mod cache;
pub mod config;
pub mod permit;
pub mod pool;
pub mod queue;
pub mod telemetry;
pub mod ticker;
pub mod worker;

pub use cache::{CacheError, TtlCache};
pub use config::{CacheOptions, ConfigError, PoolConfig, QueueConfig, RateLimitConfig};
pub use permit::{RateLimiter, Semaphore, SemaphoreError};
pub use pool::{DedupWorkerPool, PoolError, WorkerPool};
pub use queue::{QueueError, QueueState, UniQueue, WorkQueue, WorkStream};
pub use ticker::ticker_log;
pub use worker::{SideEffect, SideEffectWorker, WorkerError};

pub use tokio_util::sync::CancellationToken;
pub use tokio_util::task::TaskTracker;
