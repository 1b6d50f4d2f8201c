//! Single-shot, cancellable timers.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// A callback scheduled to run once after a delay.
///
/// Cancelling (or dropping) the handle guarantees the callback does not run
/// afterwards. Each task carries an id so the receiver of its callback can
/// tell a stale firing apart from the current timer.
#[derive(Debug)]
pub struct ScheduledTask {
    id: u64,
    token: CancellationToken,
}

impl ScheduledTask {
    pub fn after<F>(delay: Duration, id: u64, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                // biased so a cancel that races the deadline always wins
                biased;
                _ = child.cancelled() => {}
                _ = sleep(delay) => fire(),
            }
        });
        Self { id, token }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = ScheduledTask::after(Duration::from_secs(20), 7, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(task.id(), 7);

        sleep(Duration::from_secs(19)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_and_dropped_tasks_never_fire() {
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let cancelled = ScheduledTask::after(Duration::from_secs(1), 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cancelled.cancel();

        let counter = fired.clone();
        drop(ScheduledTask::after(Duration::from_secs(1), 2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
