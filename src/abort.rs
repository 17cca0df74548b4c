//! Abort registry.
//!
//! A fixed pool of cancellation signals, one per concurrent install,
//! addressed by a small integer so cancel requests can be routed without
//! leaking resources. Allocation always hands out the lowest free slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Default number of concurrent installs.
pub const DEFAULT_ABORT_CAPACITY: usize = 20;

/// Abort registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    /// Every slot is owned by an in-flight install.
    #[error("Too many concurrent installs (max {0})")]
    CapacityExceeded(usize),

    /// The id does not refer to an allocated slot.
    #[error("No in-flight install with abort id {0}")]
    NotAllocated(usize),
}

#[derive(Debug, Default)]
struct SignalInner {
    aborted: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal shared between an install session and
/// the package fetcher.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// Creates an untripped signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the signal and wakes every waiter.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns true once the signal was tripped.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the signal is tripped.
    pub async fn aborted(&self) {
        loop {
            // Registered before the check so a concurrent abort is not missed.
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// An allocated slot: its id and the signal living in it.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    /// Slot index.
    pub id: usize,
    /// Signal stored in the slot.
    pub signal: AbortSignal,
}

/// Fixed-size pool of abort signals.
#[derive(Debug)]
pub struct AbortRegistry {
    slots: Mutex<Vec<Option<AbortSignal>>>,
    capacity: usize,
}

impl Default for AbortRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ABORT_CAPACITY)
    }
}

impl AbortRegistry {
    /// Creates a registry with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "abort registry capacity must be positive");
        Self {
            slots: Mutex::new(vec![None; capacity]),
            capacity,
        }
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocates the lowest free slot with a fresh signal.
    pub fn allocate(&self) -> Result<AbortHandle, AbortError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| AbortError::CapacityExceeded(self.capacity))?;

        let Some(id) = slots.iter().position(Option::is_none) else {
            warn!("[ABORT] All {} abort slots in use", self.capacity);
            return Err(AbortError::CapacityExceeded(self.capacity));
        };

        let signal = AbortSignal::new();
        slots[id] = Some(signal.clone());
        debug!("[ABORT] Allocated slot {}", id);
        Ok(AbortHandle { id, signal })
    }

    /// Returns the signal in an allocated slot.
    #[must_use]
    pub fn signal(&self, id: usize) -> Option<AbortSignal> {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(id).cloned().flatten())
    }

    /// Trips the signal in an allocated slot.
    pub fn cancel(&self, id: usize) -> Result<(), AbortError> {
        let signal = self.signal(id).ok_or(AbortError::NotAllocated(id))?;
        info!("[ABORT] Cancelling slot {}", id);
        signal.abort();
        Ok(())
    }

    /// Frees a slot for reuse.
    ///
    /// Callers release only after removing the download item that
    /// references the slot.
    pub fn release(&self, id: usize) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(id) {
                *slot = None;
                debug!("[ABORT] Released slot {}", id);
            }
        }
    }

    /// Returns the ids of all allocated slots, ascending.
    #[must_use]
    pub fn in_use(&self) -> Vec<usize> {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| s.as_ref().map(|_| i))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_allocate_lowest_free() {
        let registry = AbortRegistry::new(3);
        assert_eq!(registry.allocate().unwrap().id, 0);
        assert_eq!(registry.allocate().unwrap().id, 1);
        assert_eq!(registry.allocate().unwrap().id, 2);

        registry.release(1);
        assert_eq!(registry.allocate().unwrap().id, 1);
    }

    #[test]
    fn test_capacity_exceeded() {
        let registry = AbortRegistry::new(1);
        registry.allocate().unwrap();
        assert_eq!(
            registry.allocate().unwrap_err(),
            AbortError::CapacityExceeded(1)
        );
    }

    #[test]
    fn test_cancel_trips_signal() {
        let registry = AbortRegistry::new(2);
        let handle = registry.allocate().unwrap();
        assert!(!handle.signal.is_aborted());
        registry.cancel(handle.id).unwrap();
        assert!(handle.signal.is_aborted());
    }

    #[test]
    fn test_cancel_unallocated() {
        let registry = AbortRegistry::new(2);
        assert_eq!(registry.cancel(1), Err(AbortError::NotAllocated(1)));
        assert_eq!(registry.cancel(9), Err(AbortError::NotAllocated(9)));
    }

    #[test]
    fn test_reused_slot_gets_fresh_signal() {
        let registry = AbortRegistry::new(1);
        let first = registry.allocate().unwrap();
        registry.cancel(first.id).unwrap();
        registry.release(first.id);

        let second = registry.allocate().unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.signal.is_aborted());
    }

    #[tokio::test]
    async fn test_aborted_wakes_waiter() {
        let signal = AbortSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.aborted().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.abort();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "abort registry capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = AbortRegistry::new(0);
    }
}
