//! Channel-backed semaphore.

use std::sync::{Mutex as StdMutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    #[error("the semaphore has been closed")]
    Closed,
}

/// A fixed set of permits.
///
/// Held permits are tokens sitting in a bounded channel: `acquire` sends one,
/// `release` receives one. Once closed (explicitly or through the parent
/// token) no permit can be acquired, while releases keep working.
pub struct Semaphore {
    tx: mpsc::Sender<()>,
    held: StdMutex<mpsc::Receiver<()>>,
    capacity: usize,
    cancel: CancellationToken,
}

impl Semaphore {
    /// Create a semaphore with `max` permits (clamped to 1).
    pub fn new(max: usize, parent: &CancellationToken) -> Self {
        let capacity = max.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            held: StdMutex::new(rx),
            capacity,
            cancel: parent.child_token(),
        }
    }

    fn held(&self) -> MutexGuard<'_, mpsc::Receiver<()>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Semaphore lock poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Wait for a permit. Returns `Closed` as soon as the semaphore closes,
    /// including while waiting.
    pub async fn acquire(&self) -> Result<(), SemaphoreError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SemaphoreError::Closed),
            sent = self.tx.send(()) => sent.map_err(|_| SemaphoreError::Closed),
        }
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.try_send(()).is_ok()
    }

    /// Return a permit. Releasing more than was acquired is a caller bug; it is
    /// logged and otherwise ignored.
    pub fn release(&self) {
        match self.held().try_recv() {
            Ok(()) => {}
            Err(TryRecvError::Empty) if !self.is_closed() => {
                tracing::warn!("Semaphore released without a held permit");
            }
            Err(_) => {}
        }
    }

    /// Close the semaphore and drop every held permit. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let mut held = self.held();
        held.close();
        while held.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Permits free right now.
    pub fn available(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1, &CancellationToken::new()));

        assert!(sem.acquire().await.is_ok());
        assert_eq!(sem.available(), 0);

        let waiter = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move { sem.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "acquired unavailable permit");

        sem.release();
        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_holders_never_exceed_capacity() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let sem = Arc::new(Semaphore::new(3, &CancellationToken::new()));
        let holding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..20).map(|_| {
            let sem = Arc::clone(&sem);
            let holding = Arc::clone(&holding);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                sem.acquire().await.unwrap();
                let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                holding.fetch_sub(1, Ordering::SeqCst);
                sem.release();
            })
        });
        for joined in futures::future::join_all(tasks).await {
            joined.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(sem.available(), 3);
    }

    #[tokio::test]
    async fn try_acquire_respects_capacity() {
        let sem = Semaphore::new(2, &CancellationToken::new());

        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.available(), 0);

        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }

    #[tokio::test]
    async fn release_without_acquire_adds_no_capacity() {
        let sem = Semaphore::new(1, &CancellationToken::new());

        sem.release();
        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[tokio::test]
    async fn parent_cancel_closes() {
        let parent = CancellationToken::new();
        let sem = Semaphore::new(1, &parent);

        parent.cancel();
        assert_eq!(sem.acquire().await, Err(SemaphoreError::Closed));
        assert!(sem.is_closed());
        assert!(!sem.try_acquire());
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let sem = Arc::new(Semaphore::new(1, &CancellationToken::new()));
        sem.acquire().await.unwrap();

        let waiter = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move { sem.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        sem.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SemaphoreError::Closed));

        // Idempotent, and releasing a permit held across close is harmless.
        sem.close();
        sem.release();
        assert_eq!(sem.available(), 0);
    }
}
