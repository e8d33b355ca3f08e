//! Parallelism plus per-second throughput limiter.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::semaphore::{Semaphore, SemaphoreError};
use crate::config::{ConfigError, RateLimitConfig};

/// Length of one quota window.
pub const QUOTA_PERIOD: Duration = Duration::from_secs(1);

struct Quota {
    used: StdMutex<usize>,
    max_per_second: usize,
    reset: Notify,
}

impl Quota {
    fn used(&self) -> MutexGuard<'_, usize> {
        self.used.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Rate limiter quota lock poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Take one unit of quota if the current window has any left.
    fn try_take(&self) -> bool {
        let mut used = self.used();
        if *used < self.max_per_second {
            *used += 1;
            true
        } else {
            false
        }
    }

    fn reset(&self) {
        *self.used() = 0;
        self.reset.notify_waiters();
    }
}

/// Caps both how many callers hold a permit at once and how many permits are
/// handed out per second.
///
/// Must be created inside a tokio runtime: construction spawns the quota tick.
pub struct RateLimiter {
    permits: Semaphore,
    quota: Arc<Quota>,
    cancel: CancellationToken,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, parent: &CancellationToken) -> Result<Self, ConfigError> {
        config.validate()?;

        let cancel = parent.child_token();
        let quota = Arc::new(Quota {
            used: StdMutex::new(0),
            max_per_second: config.max_per_second,
            reset: Notify::new(),
        });
        let ticker = tokio::spawn(tick_loop(Arc::clone(&quota), cancel.clone()));

        Ok(Self {
            permits: Semaphore::new(config.max_parallel, &cancel),
            quota,
            cancel,
            ticker: StdMutex::new(Some(ticker)),
        })
    }

    /// Wait for a permit and one unit of this second's quota.
    ///
    /// When the quota is spent the permit is kept while waiting for the next
    /// reset. On close the permit is given back and `Closed` is returned.
    pub async fn acquire(&self) -> Result<(), SemaphoreError> {
        self.permits.acquire().await?;

        loop {
            // Register before checking so a reset between the check and the
            // wait is not missed.
            let reset = self.quota.reset.notified();
            if self.quota.try_take() {
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.permits.release();
                    return Err(SemaphoreError::Closed);
                }
                _ = reset => {}
            }
        }
    }

    pub fn release(&self) {
        self.permits.release();
    }

    /// Close the limiter, failing current and future `acquire` calls. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.permits.close();
        if let Some(handle) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Quota spent in the current window.
    pub fn quota_used(&self) -> usize {
        *self.quota.used()
    }

    pub fn available(&self) -> usize {
        self.permits.available()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn tick_loop(quota: Arc<Quota>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + QUOTA_PERIOD, QUOTA_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => quota.reset(),
        }
    }
    tracing::trace!("Rate limiter tick exiting");
}
