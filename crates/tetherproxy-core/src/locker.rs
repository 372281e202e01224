//! Exclusive system resource held while the proxy is serving.
//!
//! The [`Locker`] contract is idempotent: acquiring a held lock or releasing a
//! free one does nothing. Implementations serialize their own state because two
//! independent status subscriptions may call them concurrently.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// A process-wide handle that keeps the device awake while held.
pub trait Locker: Send + Sync {
    /// Take the handle. No-op if already held.
    fn acquire(&self);

    /// Give the handle back. No-op if not held.
    fn release(&self);

    /// Whether the handle is currently held.
    fn is_held(&self) -> bool;
}

#[derive(Debug, Default)]
struct LockState {
    held_since: Option<Instant>,
    acquisitions: u64,
}

/// In-process wake lock that tracks ownership and hold time.
#[derive(Debug)]
pub struct WakeLock {
    tag: String,
    state: Mutex<LockState>,
}

impl WakeLock {
    /// Create a released lock labelled `tag` in logs.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            state: Mutex::new(LockState::default()),
        }
    }

    /// How many times the lock went from released to held.
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acquisitions
    }

    /// How long the lock has been held, if it is.
    #[must_use]
    pub fn held_for(&self) -> Option<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .held_since
            .map(|since| since.elapsed())
    }
}

impl Locker for WakeLock {
    fn acquire(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.held_since.is_some() {
            debug!(tag = %self.tag, "Wake lock already held");
            return;
        }
        state.held_since = Some(Instant::now());
        state.acquisitions += 1;
        info!(tag = %self.tag, "Wake lock acquired");
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.held_since.take() {
            Some(since) => {
                info!(
                    tag = %self.tag,
                    held_ms = u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Wake lock released"
                );
            }
            None => debug!(tag = %self.tag, "Wake lock already released"),
        }
    }

    fn is_held(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .held_since
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_and_release_are_idempotent() {
        let lock = WakeLock::new("test");
        assert!(!lock.is_held());

        lock.acquire();
        lock.acquire();
        assert!(lock.is_held());
        assert_eq!(lock.acquisitions(), 1);
        assert!(lock.held_for().is_some());

        lock.release();
        lock.release();
        assert!(!lock.is_held());
        assert!(lock.held_for().is_none());
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let lock = WakeLock::new("test");
        lock.release();
        assert!(!lock.is_held());
        assert_eq!(lock.acquisitions(), 0);
    }

    #[test]
    fn test_concurrent_callers_leave_consistent_state() {
        let lock = Arc::new(WakeLock::new("test"));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if n % 2 == 0 {
                            lock.acquire();
                        } else {
                            lock.release();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        lock.release();
        assert!(!lock.is_held());
    }
}
