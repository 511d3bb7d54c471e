//! Run-wide resources: the wake lock and per-destination run locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keeps the host awake while a run is in progress.
#[derive(Debug, Clone, Default)]
pub struct WakeLock {
    holds: Arc<AtomicUsize>,
}

impl WakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> WakeLockGuard {
        self.holds.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Wake lock acquired");
        WakeLockGuard {
            holds: Arc::clone(&self.holds),
            released: AtomicBool::new(false),
        }
    }

    pub fn is_held(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }
}

/// Releases on `release()` or, failing that, on drop. Never releases twice.
#[derive(Debug)]
pub struct WakeLockGuard {
    holds: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl WakeLockGuard {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.holds.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("Wake lock released");
        }
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// One async mutex per destination; a run holds its destination's lock until it finishes.
#[derive(Default)]
pub struct DestinationLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, destination: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(destination.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wake_lock_released_once() {
        let lock = WakeLock::new();
        let guard = lock.acquire();
        assert!(lock.is_held());

        guard.release();
        guard.release();
        assert!(!lock.is_held());

        drop(guard);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_wake_lock_released_on_drop() {
        let lock = WakeLock::new();
        {
            let _guard = lock.acquire();
            assert!(lock.is_held());
        }
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_same_destination_serializes() {
        let locks = Arc::new(DestinationLocks::new());
        let first = locks.acquire("dest").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("dest").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _other = locks.acquire("other").await;

        drop(first);
        waiter.await.unwrap();
    }
}
