//! Distributed Lock Data Model

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use quince_common::MemberId;
use serde::{Deserialize, Serialize};

static NEXT_HOLDER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a lock: the region path and the entry key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub region: String,
    pub key: String,
}

impl LockKey {
    pub fn new(region: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            key: key.into(),
        }
    }
}

impl Display for LockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.region, self.key)
    }
}

/// Who holds, or waits for, a lock.
///
/// A member runs many concurrent callers; each caller gets its own holder id so
/// that callers on the same member still exclude each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub member: MemberId,
    pub holder: u64,
}

impl LockOwner {
    /// Allocate a fresh holder on `member`
    pub fn next(member: MemberId) -> Self {
        Self {
            member,
            holder: NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.member, self.holder)
    }
}

/// Snapshot of a granted lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockToken {
    pub key: LockKey,
    pub owner: LockOwner,
    /// Monotonically increasing per service, usable as a fencing token
    pub lease_id: u64,
    /// Acquisition timestamp (Unix millis)
    pub acquired_at: i64,
    /// Lease expiration timestamp (Unix millis), `None` for no lease
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl LockToken {
    pub fn is_owned_by(&self, owner: &LockOwner) -> bool {
        &self.owner == owner
    }

    /// Remaining lease in milliseconds, `None` when the token never expires
    pub fn remaining_lease_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|expires_at| (expires_at - current_timestamp()).max(0) as u64)
    }
}

/// Lifecycle of a granted lease as seen by its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// The handle owns the token
    Held,
    /// The owner released the token
    Released,
    /// The token was destroyed because the owner left or the lease expired
    Reclaimed,
}

/// Shared state between a granted token and the handle given to its owner
#[derive(Debug)]
pub(crate) struct LeaseCell(AtomicU8);

impl LeaseCell {
    const HELD: u8 = 0;
    const RELEASED: u8 = 1;
    const RECLAIMED: u8 = 2;

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(Self::HELD)))
    }

    pub(crate) fn status(&self) -> LeaseStatus {
        match self.0.load(Ordering::Acquire) {
            Self::HELD => LeaseStatus::Held,
            Self::RELEASED => LeaseStatus::Released,
            _ => LeaseStatus::Reclaimed,
        }
    }

    /// Move from `Held` to `next`; false if the lease already ended
    pub(crate) fn finish(&self, next: LeaseStatus) -> bool {
        let next = match next {
            LeaseStatus::Held => return false,
            LeaseStatus::Released => Self::RELEASED,
            LeaseStatus::Reclaimed => Self::RECLAIMED,
        };
        self.0
            .compare_exchange(Self::HELD, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Proof of ownership returned by a successful acquire
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub(crate) token: LockToken,
    pub(crate) lease: Arc<LeaseCell>,
}

impl LockHandle {
    pub fn key(&self) -> &LockKey {
        &self.token.key
    }

    pub fn owner(&self) -> &LockOwner {
        &self.token.owner
    }

    pub fn lease_id(&self) -> u64 {
        self.token.lease_id
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn status(&self) -> LeaseStatus {
        self.lease.status()
    }

    /// Whether the handle still owns its token
    pub fn is_held(&self) -> bool {
        self.status() == LeaseStatus::Held
    }
}

/// Lock acquisition request
#[derive(Debug, Clone)]
pub struct LockAcquireRequest {
    pub key: LockKey,
    pub owner: LockOwner,
    /// Maximum wait: negative waits until shutdown, 0 is non-blocking
    pub wait_ms: i64,
    /// Lease length; the token is reclaimed when it runs out
    pub lease_ms: Option<u64>,
}

impl LockAcquireRequest {
    pub fn new(key: LockKey, owner: LockOwner) -> Self {
        Self {
            key,
            owner,
            wait_ms: 0,
            lease_ms: None,
        }
    }

    pub fn with_wait_ms(mut self, wait_ms: i64) -> Self {
        self.wait_ms = wait_ms;
        self
    }

    pub fn with_lease_ms(mut self, lease_ms: Option<u64>) -> Self {
        self.lease_ms = lease_ms;
        self
    }
}

/// Filter for listing granted tokens
#[derive(Debug, Clone)]
pub struct LockQuery {
    pub region: Option<String>,
    pub member: Option<MemberId>,
    pub limit: usize,
}

impl Default for LockQuery {
    fn default() -> Self {
        Self {
            region: None,
            member: None,
            limit: 100,
        }
    }
}

/// Lock statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStats {
    /// Lock table entries created; a key is counted again after its entry was
    /// dropped while idle
    pub total_locks: u64,
    /// Currently held tokens
    pub active_locks: u32,
    /// Callers currently queued
    pub waiting: u32,
    pub total_acquisitions: u64,
    pub total_releases: u64,
    /// Tokens destroyed because their owner left the cluster
    pub reclaimed_locks: u64,
    /// Tokens destroyed because their lease ran out
    pub expired_locks: u64,
    /// Acquisitions that timed out or failed a non-blocking attempt
    pub failed_acquisitions: u64,
    /// Waits ended by shutdown, departure or caller cancellation
    pub cancelled_waits: u64,
    pub avg_hold_time_ms: u64,
}

pub(crate) fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_display() {
        let key = LockKey::new("/ROOT/orders", "KEY");
        assert_eq!(key.to_string(), "/ROOT/orders::KEY");
    }

    #[test]
    fn test_lock_owner_holders_are_unique() {
        let member = MemberId::new("m1");
        let a = LockOwner::next(member.clone());
        let b = LockOwner::next(member);
        assert_ne!(a, b);
        assert_eq!(a.member, b.member);
        assert!(a.to_string().starts_with("m1#"));
    }

    #[test]
    fn test_lease_cell_finishes_once() {
        let lease = LeaseCell::new();
        assert_eq!(lease.status(), LeaseStatus::Held);

        assert!(lease.finish(LeaseStatus::Reclaimed));
        assert_eq!(lease.status(), LeaseStatus::Reclaimed);

        // A reclaimed lease cannot later be marked released
        assert!(!lease.finish(LeaseStatus::Released));
        assert_eq!(lease.status(), LeaseStatus::Reclaimed);
    }

    #[test]
    fn test_remaining_lease() {
        let now = current_timestamp();
        let token = LockToken {
            key: LockKey::new("/r", "k"),
            owner: LockOwner::next(MemberId::new("m1")),
            lease_id: 1,
            acquired_at: now,
            expires_at: Some(now + 60_000),
        };
        assert!(token.remaining_lease_ms().unwrap() > 50_000);

        let unbounded = LockToken {
            expires_at: None,
            ..token
        };
        assert!(unbounded.remaining_lease_ms().is_none());
    }
}
