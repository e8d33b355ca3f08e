//! Periodic callbacks tied to a cancellation token.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Run `f` every `period` until `cancel` fires. The first call happens one
/// period after spawning.
///
/// Used for status log lines, e.g. a queue reporting how much work is
/// inflight. Missed ticks are skipped rather than replayed in a burst.
pub fn ticker_log<F>(period: Duration, cancel: CancellationToken, mut f: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => f(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn runs_once_per_period_until_cancelled() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = {
            let count = Arc::clone(&count);
            ticker_log(Duration::from_millis(10), cancel.clone(), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(105)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 10);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
