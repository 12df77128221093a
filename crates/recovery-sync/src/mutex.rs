//! FIFO-fair async mutex
//!
//! Waiters are granted the lock in arrival order. `acquire` hands back a
//! [`ReleaseHandle`]; releasing consumes the handle, so a lock can only be
//! released once, and dropping the handle on any exit path releases it too.

use std::sync::Arc;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

/// Async mutual exclusion with an owned release handle
#[derive(Debug, Default)]
pub struct Mutex {
    inner: Arc<TokioMutex<()>>,
}

impl Mutex {
    /// Create a new unlocked mutex
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock
    ///
    /// Concurrent callers queue and are served first-come first-served.
    pub async fn acquire(&self) -> ReleaseHandle {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        ReleaseHandle { _guard: guard }
    }

    /// Take the lock only if it is free right now
    #[must_use]
    pub fn try_acquire(&self) -> Option<ReleaseHandle> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(|guard| ReleaseHandle { _guard: guard })
    }

    /// Whether some holder currently owns the lock
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Proof of lock ownership; the lock is released when this is consumed or dropped
#[derive(Debug)]
#[must_use = "the lock is released as soon as the handle is dropped"]
pub struct ReleaseHandle {
    _guard: OwnedMutexGuard<()>,
}

impl ReleaseHandle {
    /// Release the lock
    #[inline]
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn mutex_acquire_and_release() {
        let mutex = Mutex::new();
        let handle = mutex.acquire().await;
        assert!(mutex.is_locked());
        assert!(mutex.try_acquire().is_none());

        handle.release();
        assert!(!mutex.is_locked());
        assert!(mutex.try_acquire().is_some());
    }

    #[tokio::test]
    async fn mutex_released_on_drop() {
        let mutex = Mutex::new();
        {
            let _handle = mutex.acquire().await;
            assert!(mutex.is_locked());
        }
        assert!(!mutex.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn mutex_grants_in_arrival_order() {
        let mutex = Arc::new(Mutex::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = mutex.acquire().await;

        let mut tasks = Vec::new();
        for i in 0..5 {
            let mutex = Arc::clone(&mutex);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let handle = mutex.acquire().await;
                order.lock().push(i);
                handle.release();
            }));
            // Let each waiter enqueue before spawning the next
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        first.release();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }
}
