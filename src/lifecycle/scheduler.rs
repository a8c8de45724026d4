//! # Eviction Scheduler
//!
//! A single cancellable delayed action, built as a spawned tokio task that is
//! aborted on re-arm. `arm` supersedes any previously armed timer, so at most
//! one timer is ever outstanding; when the timer fires uninterrupted it runs
//! the eviction future it was armed with.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct EvictionScheduler {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionScheduler {
    pub fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }

    /// Schedule `on_fire` to run after `delay`, cancelling any previously
    /// armed timer. The countdown starts now, not at the previous arm.
    pub fn arm<F>(&self, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire.await;
        });

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        debug!("Eviction timer armed for {}s from now", delay.as_secs());
    }

    /// Cancel the outstanding timer, if any.
    pub fn cancel(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            debug!("Eviction timer cancelled");
        }
    }

    /// Whether a timer is currently armed and has not fired.
    pub fn is_armed(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        task.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Default for EvictionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_timer_fires_after_delay() {
        let scheduler = EvictionScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        scheduler.arm(Duration::from_millis(30), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.is_armed());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_rearm_supersedes_previous_timer() {
        let scheduler = EvictionScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        scheduler.arm(Duration::from_millis(50), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Re-arming restarts the countdown from the second arm
        let counter = fired.clone();
        scheduler.arm(Duration::from_millis(50), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // 30ms later the first timer would have fired; the second must not have
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // After the full second delay exactly one fire is observed
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let scheduler = EvictionScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        scheduler.arm(Duration::from_millis(30), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel();
        assert!(!scheduler.is_armed());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
