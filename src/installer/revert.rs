//! Delayed return to a steady state after an install ends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::AddonId;

/// Grace period before a finished, cancelled or failed install reverts.
pub const REVERT_DELAY: Duration = Duration::from_secs(3);

/// One pending revert task per addon.
///
/// Scheduling replaces (and aborts) the previous task of the addon.
#[derive(Debug)]
pub(super) struct RevertScheduler {
    delay: Duration,
    timers: Mutex<HashMap<AddonId, JoinHandle<()>>>,
}

impl RevertScheduler {
    pub(super) fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `revert` for `id` after the delay.
    pub(super) fn schedule<F>(&self, id: &AddonId, revert: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            revert.await;
        });

        if let Ok(mut timers) = self.timers.lock() {
            if let Some(previous) = timers.insert(id.clone(), handle) {
                previous.abort();
            }
        }
        debug!("[REVERT] Scheduled revert of {} in {:?}", id, delay);
    }

    /// Drops the pending revert of `id`, if any.
    pub(super) fn cancel(&self, id: &AddonId) {
        let handle = self.timers.lock().ok().and_then(|mut t| t.remove(id));
        if let Some(handle) = handle {
            handle.abort();
            debug!("[REVERT] Cancelled pending revert of {}", id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_revert_runs_after_delay() {
        let scheduler = RevertScheduler::new(Duration::from_millis(20));
        let count = Arc::new(AtomicU32::new(0));
        let id = AddonId::new("p", "a");

        let c = count.clone();
        scheduler.schedule(&id, async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_and_reschedule() {
        let scheduler = RevertScheduler::new(Duration::from_millis(30));
        let count = Arc::new(AtomicU32::new(0));
        let id = AddonId::new("p", "a");

        let c = count.clone();
        scheduler.schedule(&id, async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel(&id);

        let c = count.clone();
        scheduler.schedule(&id, async move {
            c.fetch_add(10, Ordering::SeqCst);
        });
        let c = count.clone();
        scheduler.schedule(&id, async move {
            c.fetch_add(100, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }
}
