//! Quince Consistency - cluster-shared coordination state
//!
//! This crate provides:
//! - Distributed lock service keyed by (region, key) with FIFO waiters,
//!   lease expiry and reclaim on member departure
//! - Region scope registry enforcing one scope per region cluster-wide

pub mod lock;
pub mod scope;

// Re-export lock types
pub use lock::{
    DistributedLockService, LeaseStatus, LockAcquireRequest, LockHandle, LockKey, LockOwner,
    LockQuery, LockStats, LockToken, MemoryLockService,
};

// Re-export scope types
pub use scope::{ReconcileOutcome, RegistrationOutcome, ScopeRecord, ScopeRegistry};
