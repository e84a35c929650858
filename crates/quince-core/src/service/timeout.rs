//! Per-member timeout policy

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use quince_common::{DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_SEARCH_TIMEOUT_SECS};

/// Upper bound for either timeout, about thirty years. Larger settings are
/// treated as this so deadlines computed from them stay representable.
pub const MAX_TIMEOUT_SECS: u64 = 30 * 365 * 24 * 60 * 60;

/// Bounds for distributed waits, adjustable at runtime.
///
/// `lock_timeout` bounds the lock wait of a write; `search_timeout` bounds
/// peer lookups and the lock wait of a read that has to invoke its loader.
#[derive(Debug)]
pub struct TimeoutPolicy {
    lock_timeout_secs: AtomicU64,
    search_timeout_secs: AtomicU64,
}

impl TimeoutPolicy {
    pub fn new(lock_timeout_secs: u64, search_timeout_secs: u64) -> Self {
        Self {
            lock_timeout_secs: AtomicU64::new(lock_timeout_secs),
            search_timeout_secs: AtomicU64::new(search_timeout_secs),
        }
    }

    pub fn set_lock_timeout(&self, seconds: u64) {
        self.lock_timeout_secs.store(seconds, Ordering::Release);
    }

    pub fn set_search_timeout(&self, seconds: u64) {
        self.search_timeout_secs.store(seconds, Ordering::Release);
    }

    pub fn lock_timeout(&self) -> Duration {
        bounded(self.lock_timeout_secs.load(Ordering::Acquire))
    }

    pub fn search_timeout(&self) -> Duration {
        bounded(self.search_timeout_secs.load(Ordering::Acquire))
    }

    /// Lock wait for a write in the lock service's `wait_ms` convention
    pub fn lock_wait_ms(&self) -> i64 {
        wait_ms(self.lock_timeout())
    }

    /// Lock wait for a loading read in the lock service's `wait_ms` convention
    pub fn search_wait_ms(&self) -> i64 {
        wait_ms(self.search_timeout())
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_SEARCH_TIMEOUT_SECS)
    }
}

fn bounded(seconds: u64) -> Duration {
    Duration::from_secs(seconds.min(MAX_TIMEOUT_SECS))
}

// A zero timeout is a non-blocking attempt
fn wait_ms(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX)
}
