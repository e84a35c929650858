//! Distributed Lock Service Implementation
//!
//! Provides:
//! - Lock acquire/release API
//! - FIFO waiter queues with abandon-on-timeout
//! - Token reclaim when the owning member leaves the cluster
//! - Lease expiry with a background scanner

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use quince_common::{GridError, MemberId, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::{debug, info, warn};

use super::model::*;

/// Distributed Lock Service trait
///
/// At most one [`LockHandle`] is outstanding per [`LockKey`] across every
/// member sharing the service.
#[async_trait]
pub trait DistributedLockService: Send + Sync {
    /// Acquire a lock, waiting according to `request.wait_ms`
    async fn acquire(&self, request: LockAcquireRequest) -> Result<LockHandle>;

    /// Release a lock. Releasing twice is a no-op; releasing a reclaimed
    /// handle fails with [`GridError::StaleLockHandle`].
    async fn release(&self, handle: &LockHandle) -> Result<()>;

    /// Get the live token for a key
    async fn get(&self, key: &LockKey) -> Option<LockToken>;

    /// List live tokens
    async fn list(&self, query: LockQuery) -> Vec<LockToken>;

    /// Reclaim every token owned by a member that left the cluster and
    /// drop its queued waiters. Returns the number of reclaimed tokens.
    async fn member_departed(&self, member: &MemberId) -> usize;

    /// Get lock statistics
    async fn get_stats(&self) -> LockStats;

    /// Stop accepting requests and cancel every queued waiter
    async fn shutdown(&self);

    async fn is_locked(&self, key: &LockKey) -> bool {
        self.get(key).await.is_some()
    }
}

struct GrantedToken {
    token: LockToken,
    lease: Arc<LeaseCell>,
    granted_at: Instant,
    deadline: Option<Instant>,
}

impl GrantedToken {
    fn handle(&self) -> LockHandle {
        LockHandle {
            token: self.token.clone(),
            lease: self.lease.clone(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

struct LockWaiter {
    id: u64,
    owner: LockOwner,
    lease_ms: Option<u64>,
    tx: oneshot::Sender<LockHandle>,
}

#[derive(Default)]
struct LockSlot {
    granted: Option<GrantedToken>,
    waiters: VecDeque<LockWaiter>,
}

impl LockSlot {
    fn is_idle(&self) -> bool {
        self.granted.is_none() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct LockStatsCollector {
    total_locks: AtomicU64,
    total_acquisitions: AtomicU64,
    total_releases: AtomicU64,
    reclaimed_locks: AtomicU64,
    expired_locks: AtomicU64,
    failed_acquisitions: AtomicU64,
    cancelled_waits: AtomicU64,
    total_hold_time_ms: AtomicU64,
    completed_holds: AtomicU64,
}

/// Token bookkeeping shared with the expiry scanner
#[derive(Default)]
struct Grantor {
    next_lease: AtomicU64,
    held: AtomicU64,
    stats: LockStatsCollector,
}

impl Grantor {
    fn publish_held(&self, held: u64) {
        metrics::gauge!("quince_locks_held").set(held as f64);
    }

    /// Clear the slot's grant, keeping the held count in step
    fn clear_grant(&self, slot: &mut LockSlot) -> Option<GrantedToken> {
        let granted = slot.granted.take()?;
        let held = self.held.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.publish_held(held);
        Some(granted)
    }

    /// Hand the free slot to `owner`
    fn grant(
        &self,
        key: &LockKey,
        slot: &mut LockSlot,
        owner: LockOwner,
        lease_ms: Option<u64>,
    ) -> LockHandle {
        let now = current_timestamp();
        let granted = GrantedToken {
            token: LockToken {
                key: key.clone(),
                owner,
                lease_id: self.next_lease.fetch_add(1, Ordering::Relaxed) + 1,
                acquired_at: now,
                expires_at: lease_ms
                    .map(|ms| now.saturating_add(i64::try_from(ms).unwrap_or(i64::MAX))),
            },
            lease: LeaseCell::new(),
            granted_at: Instant::now(),
            // A lease too long to represent never expires
            deadline: lease_ms
                .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms))),
        };
        let handle = granted.handle();
        slot.granted = Some(granted);
        let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
        self.publish_held(held);
        handle
    }

    /// Grant the free slot to the oldest waiter still listening
    fn grant_next(&self, key: &LockKey, slot: &mut LockSlot) {
        while slot.granted.is_none() {
            let Some(waiter) = slot.waiters.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() {
                self.stats.cancelled_waits.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let handle = self.grant(key, slot, waiter.owner, waiter.lease_ms);
            match waiter.tx.send(handle) {
                Ok(()) => {
                    self.stats
                        .total_acquisitions
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, waiter = waiter.id, "Lock handed to next waiter");
                }
                Err(handle) => {
                    // receiver dropped between the check and the send
                    handle.lease.finish(LeaseStatus::Released);
                    self.clear_grant(slot);
                    self.stats.cancelled_waits.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// End the current grant and pass the slot on
    fn end_current(&self, key: &LockKey, slot: &mut LockSlot, status: LeaseStatus) -> bool {
        let Some(granted) = self.clear_grant(slot) else {
            return false;
        };
        granted.lease.finish(status);

        let held_ms = granted.granted_at.elapsed().as_millis() as u64;
        self.stats
            .total_hold_time_ms
            .fetch_add(held_ms, Ordering::Relaxed);
        self.stats.completed_holds.fetch_add(1, Ordering::Relaxed);

        self.grant_next(key, slot);
        true
    }

    /// Reclaim the current grant if its lease ran out
    fn expire_due(&self, key: &LockKey, slot: &mut LockSlot, now: Instant) -> bool {
        let expired = slot.granted.as_ref().is_some_and(|g| g.is_expired(now));
        if !expired {
            return false;
        }

        if let Some(granted) = &slot.granted {
            warn!(
                key = %key,
                owner = %granted.token.owner,
                lease_id = granted.token.lease_id,
                "Lock lease expired, reclaiming"
            );
        }
        self.stats.expired_locks.fetch_add(1, Ordering::Relaxed);
        self.end_current(key, slot, LeaseStatus::Reclaimed)
    }
}

/// In-memory lock service shared by every member of a cluster
pub struct MemoryLockService {
    slots: Arc<DashMap<LockKey, LockSlot>>,
    grantor: Arc<Grantor>,
    next_waiter: AtomicU64,
    closed: AtomicBool,
    expiry_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            grantor: Arc::new(Grantor::default()),
            next_waiter: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            expiry_handle: Mutex::new(None),
        }
    }

    /// Start a background task reclaiming expired leases every `interval_ms`
    pub fn with_expiry_scan(self, interval_ms: u64) -> Self {
        let slots = self.slots.clone();
        let grantor = self.grantor.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                ticker.tick().await;
                Self::expire_locks(&slots, &grantor);
            }
        });

        *self.expiry_handle.lock() = Some(handle);
        self
    }

    fn expire_locks(slots: &DashMap<LockKey, LockSlot>, grantor: &Grantor) -> usize {
        let now = Instant::now();
        let mut expired = 0;

        for mut entry in slots.iter_mut() {
            let (key, slot) = entry.pair_mut();
            if grantor.expire_due(key, slot, now) {
                expired += 1;
            }
        }
        slots.retain(|_, slot| !slot.is_idle());

        if expired > 0 {
            debug!(count = expired, "Reclaimed expired lock leases");
        }
        expired
    }

    fn release_handle(&self, handle: &LockHandle) -> Result<()> {
        match handle.status() {
            LeaseStatus::Released => {
                debug!(key = %handle.key(), lease_id = handle.lease_id(), "Lock already released");
                return Ok(());
            }
            LeaseStatus::Reclaimed => return Err(stale(handle)),
            LeaseStatus::Held => {}
        }

        {
            let Some(mut slot) = self.slots.get_mut(handle.key()) else {
                return Err(stale(handle));
            };
            let current = slot
                .granted
                .as_ref()
                .is_some_and(|g| g.token.lease_id == handle.lease_id());
            if !current {
                drop(slot);
                return match handle.status() {
                    LeaseStatus::Released => Ok(()),
                    _ => Err(stale(handle)),
                };
            }

            self.grantor
                .end_current(handle.key(), &mut slot, LeaseStatus::Released);
        }
        self.prune(handle.key());
        self.grantor
            .stats
            .total_releases
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %handle.key(),
            owner = %handle.owner(),
            lease_id = handle.lease_id(),
            "Lock released"
        );
        Ok(())
    }

    /// Drop the slot of `key` once nobody holds or waits for it
    fn prune(&self, key: &LockKey) {
        self.slots.remove_if(key, |_, slot| slot.is_idle());
    }

    fn cancelled(&self, key: &LockKey) -> GridError {
        self.grantor
            .stats
            .cancelled_waits
            .fetch_add(1, Ordering::Relaxed);
        GridError::Cancelled(format!("wait for lock {} ended", key))
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryLockService {
    fn drop(&mut self) {
        if let Some(handle) = self.expiry_handle.lock().take() {
            handle.abort();
        }
    }
}

/// A queued acquire. Dropping it before the outcome was observed removes the
/// waiter and hands back a grant that arrived in the meantime.
struct PendingWaiter<'a> {
    service: &'a MemoryLockService,
    key: LockKey,
    id: u64,
    rx: oneshot::Receiver<LockHandle>,
    settled: bool,
}

impl PendingWaiter<'_> {
    fn abandon(&mut self) -> Option<LockHandle> {
        self.settled = true;
        let id = self.id;
        if let Some(mut slot) = self.service.slots.get_mut(&self.key) {
            slot.waiters.retain(|w| w.id != id);
        }
        self.service.prune(&self.key);
        // a grant sent before removal is already in the channel
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(handle) = self.abandon() {
            debug!(key = %self.key, "Returning lock granted to an abandoned waiter");
            let _ = self.service.release_handle(&handle);
        }
    }
}

#[async_trait]
impl DistributedLockService for MemoryLockService {
    async fn acquire(&self, request: LockAcquireRequest) -> Result<LockHandle> {
        let LockAcquireRequest {
            key,
            owner,
            wait_ms,
            lease_ms,
        } = request;

        if self.closed.load(Ordering::Acquire) {
            return Err(self.cancelled(&key));
        }

        let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let rx = {
            let mut slot = self.slots.entry(key.clone()).or_insert_with(|| {
                self.grantor
                    .stats
                    .total_locks
                    .fetch_add(1, Ordering::Relaxed);
                LockSlot::default()
            });

            self.grantor.expire_due(&key, &mut slot, Instant::now());
            if slot.granted.is_none() {
                self.grantor.grant_next(&key, &mut slot);
            }

            if let Some(granted) = slot.granted.as_ref()
                && granted.token.is_owned_by(&owner)
            {
                // re-acquire by the holder returns the same lease
                return Ok(granted.handle());
            }

            if slot.granted.is_none() {
                let handle = self.grantor.grant(&key, &mut slot, owner, lease_ms);
                self.grantor
                    .stats
                    .total_acquisitions
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %key,
                    owner = %handle.owner(),
                    lease_id = handle.lease_id(),
                    "Lock acquired"
                );
                return Ok(handle);
            }

            if wait_ms == 0 {
                self.grantor
                    .stats
                    .failed_acquisitions
                    .fetch_add(1, Ordering::Relaxed);
                return Err(GridError::LockTimeout {
                    region: key.region.clone(),
                    key: key.key.clone(),
                    waited_ms: 0,
                });
            }

            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(LockWaiter {
                id: waiter_id,
                owner,
                lease_ms,
                tx,
            });
            rx
        };

        let mut pending = PendingWaiter {
            service: self,
            key,
            id: waiter_id,
            rx,
            settled: false,
        };
        let started = Instant::now();

        let received = if wait_ms < 0 {
            Some((&mut pending.rx).await)
        } else {
            tokio::time::timeout(Duration::from_millis(wait_ms as u64), &mut pending.rx)
                .await
                .ok()
        };

        match received {
            Some(Ok(handle)) => {
                pending.settled = true;
                Ok(handle)
            }
            Some(Err(_)) => {
                pending.settled = true;
                self.prune(&pending.key);
                Err(self.cancelled(&pending.key))
            }
            None => {
                if let Some(handle) = pending.abandon() {
                    return Ok(handle);
                }
                self.grantor
                    .stats
                    .failed_acquisitions
                    .fetch_add(1, Ordering::Relaxed);
                debug!(key = %pending.key, wait_ms, "Lock wait timed out");
                Err(GridError::LockTimeout {
                    region: pending.key.region.clone(),
                    key: pending.key.key.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        self.release_handle(handle)
    }

    async fn get(&self, key: &LockKey) -> Option<LockToken> {
        let now = Instant::now();
        self.slots.get(key).and_then(|slot| {
            slot.granted
                .as_ref()
                .filter(|g| !g.is_expired(now))
                .map(|g| g.token.clone())
        })
    }

    async fn list(&self, query: LockQuery) -> Vec<LockToken> {
        let now = Instant::now();
        let mut results: Vec<LockToken> = self
            .slots
            .iter()
            .filter_map(|slot| {
                slot.granted
                    .as_ref()
                    .filter(|g| !g.is_expired(now))
                    .map(|g| g.token.clone())
            })
            .filter(|token| {
                query
                    .region
                    .as_ref()
                    .is_none_or(|region| &token.key.region == region)
            })
            .filter(|token| {
                query
                    .member
                    .as_ref()
                    .is_none_or(|member| &token.owner.member == member)
            })
            .collect();

        results.sort_by(|a, b| a.key.cmp(&b.key));
        results.truncate(query.limit);
        results
    }

    async fn member_departed(&self, member: &MemberId) -> usize {
        let mut reclaimed = 0;

        for mut entry in self.slots.iter_mut() {
            let (key, slot) = entry.pair_mut();

            let queued = slot.waiters.len();
            slot.waiters.retain(|w| &w.owner.member != member);
            let dropped = (queued - slot.waiters.len()) as u64;
            if dropped > 0 {
                self.grantor
                    .stats
                    .cancelled_waits
                    .fetch_add(dropped, Ordering::Relaxed);
            }

            let owned = slot
                .granted
                .as_ref()
                .is_some_and(|g| &g.token.owner.member == member);
            if owned && self.grantor.end_current(key, slot, LeaseStatus::Reclaimed) {
                warn!(key = %key, member = %member, "Reclaimed lock held by departed member");
                self.grantor
                    .stats
                    .reclaimed_locks
                    .fetch_add(1, Ordering::Relaxed);
                reclaimed += 1;
            }
        }

        self.slots.retain(|_, slot| !slot.is_idle());

        if reclaimed > 0 {
            info!(member = %member, count = reclaimed, "Reclaimed locks of departed member");
        }
        reclaimed
    }

    async fn get_stats(&self) -> LockStats {
        let mut active_locks = 0u32;
        let mut waiting = 0u32;
        for slot in self.slots.iter() {
            if slot.granted.is_some() {
                active_locks += 1;
            }
            waiting += slot.waiters.len() as u32;
        }

        let stats = &self.grantor.stats;
        let completed = stats.completed_holds.load(Ordering::Relaxed);
        let total_hold = stats.total_hold_time_ms.load(Ordering::Relaxed);
        let avg_hold = if completed > 0 {
            total_hold / completed
        } else {
            0
        };

        LockStats {
            total_locks: stats.total_locks.load(Ordering::Relaxed),
            active_locks,
            waiting,
            total_acquisitions: stats.total_acquisitions.load(Ordering::Relaxed),
            total_releases: stats.total_releases.load(Ordering::Relaxed),
            reclaimed_locks: stats.reclaimed_locks.load(Ordering::Relaxed),
            expired_locks: stats.expired_locks.load(Ordering::Relaxed),
            failed_acquisitions: stats.failed_acquisitions.load(Ordering::Relaxed),
            cancelled_waits: stats.cancelled_waits.load(Ordering::Relaxed),
            avg_hold_time_ms: avg_hold,
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut cancelled = 0u64;
        for mut slot in self.slots.iter_mut() {
            cancelled += slot.waiters.len() as u64;
            // dropping the senders wakes every waiter with a cancellation
            slot.waiters.clear();
        }
        self.slots.retain(|_, slot| !slot.is_idle());
        self.grantor
            .stats
            .cancelled_waits
            .fetch_add(cancelled, Ordering::Relaxed);

        if let Some(handle) = self.expiry_handle.lock().take() {
            handle.abort();
        }
        info!(cancelled, "Lock service shut down");
    }
}

fn stale(handle: &LockHandle) -> GridError {
    GridError::StaleLockHandle {
        region: handle.key().region.clone(),
        key: handle.key().key.clone(),
        lease_id: handle.lease_id(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(member: &str) -> LockOwner {
        LockOwner::next(MemberId::new(member))
    }

    fn request(owner: LockOwner) -> LockAcquireRequest {
        LockAcquireRequest::new(LockKey::new("/ROOT/test", "KEY"), owner)
    }

    #[tokio::test]
    async fn test_basic_lock_acquire_release() {
        let service = MemoryLockService::new();

        let handle = service.acquire(request(owner("m1"))).await.unwrap();
        assert!(handle.is_held());
        assert!(handle.lease_id() > 0);
        assert!(service.is_locked(handle.key()).await);

        // Non-blocking attempt by another owner fails immediately
        let err = service.acquire(request(owner("m2"))).await.unwrap_err();
        assert!(matches!(err, GridError::LockTimeout { waited_ms: 0, .. }));

        service.release(&handle).await.unwrap();
        assert_eq!(handle.status(), LeaseStatus::Released);
        assert!(!service.is_locked(handle.key()).await);

        let second = service.acquire(request(owner("m2"))).await.unwrap();
        assert!(second.lease_id() > handle.lease_id());
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let service = MemoryLockService::new();
        let handle = service.acquire(request(owner("m1"))).await.unwrap();

        service.release(&handle).await.unwrap();
        service.release(&handle).await.unwrap();

        let stats = service.get_stats().await;
        assert_eq!(stats.total_releases, 1);
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_returns_same_lease() {
        let service = MemoryLockService::new();
        let me = owner("m1");

        let first = service.acquire(request(me.clone())).await.unwrap();
        let again = service.acquire(request(me)).await.unwrap();
        assert_eq!(first.lease_id(), again.lease_id());

        service.release(&again).await.unwrap();
        assert!(!first.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_granted_in_request_order() {
        let service = Arc::new(MemoryLockService::new());
        let holder = service.acquire(request(owner("m0"))).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 1..=3 {
            let service = service.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let member = format!("m{}", i);
                let handle = service
                    .acquire(request(owner(&member)).with_wait_ms(-1))
                    .await
                    .unwrap();
                order.lock().push(i);
                service.release(&handle).await.unwrap();
            }));
            // let the waiter enqueue before spawning the next one
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(service.get_stats().await.waiting, 3);
        service.release(&holder).await.unwrap();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_leaves_no_phantom() {
        let service = MemoryLockService::new();
        let holder = service.acquire(request(owner("m1"))).await.unwrap();

        let err = service
            .acquire(request(owner("m2")).with_wait_ms(100))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::LockTimeout { waited_ms, .. } if waited_ms >= 100));
        assert_eq!(service.get_stats().await.waiting, 0);

        service.release(&holder).await.unwrap();
        // The slot is free, not handed to the departed waiter
        assert!(!service.is_locked(holder.key()).await);
        let next = service.acquire(request(owner("m3"))).await.unwrap();
        assert!(next.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_acquire_future_is_abandoned() {
        let service = Arc::new(MemoryLockService::new());
        let holder = service.acquire(request(owner("m1"))).await.unwrap();

        // Caller-side timeout around an unbounded wait
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            service.acquire(request(owner("m2")).with_wait_ms(-1)),
        )
        .await;
        assert!(outcome.is_err());

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acquire(request(owner("m3")).with_wait_ms(-1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        service.release(&holder).await.unwrap();
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.owner().member, MemberId::new("m3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_departure_reclaims_and_grants_next() {
        let service = Arc::new(MemoryLockService::new());
        let crashed = service.acquire(request(owner("m1"))).await.unwrap();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acquire(request(owner("m2")).with_wait_ms(-1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(service.member_departed(&MemberId::new("m1")).await, 1);
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.owner().member, MemberId::new("m2"));

        // The crashed holder's handle is stale, distinctly from a double release
        assert_eq!(crashed.status(), LeaseStatus::Reclaimed);
        let err = service.release(&crashed).await.unwrap_err();
        assert!(matches!(err, GridError::StaleLockHandle { .. }));

        let stats = service.get_stats().await;
        assert_eq!(stats.reclaimed_locks, 1);
        assert_eq!(stats.active_locks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_member_waiters_are_cancelled() {
        let service = Arc::new(MemoryLockService::new());
        let holder = service.acquire(request(owner("m1"))).await.unwrap();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acquire(request(owner("m2")).with_wait_ms(-1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(service.member_departed(&MemberId::new("m2")).await, 0);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, GridError::Cancelled(_)));
        assert!(holder.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_reclaims_token() {
        let service = MemoryLockService::new();
        let leased = service
            .acquire(request(owner("m1")).with_lease_ms(Some(50)))
            .await
            .unwrap();
        assert!(leased.token().expires_at.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!service.is_locked(leased.key()).await);

        let next = service.acquire(request(owner("m2"))).await.unwrap();
        assert!(next.is_held());
        assert!(matches!(
            service.release(&leased).await,
            Err(GridError::StaleLockHandle { .. })
        ));
        assert_eq!(service.get_stats().await.expired_locks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_scanner_grants_waiter() {
        let service = Arc::new(MemoryLockService::new().with_expiry_scan(10));
        let _leased = service
            .acquire(request(owner("m1")).with_lease_ms(Some(30)))
            .await
            .unwrap();

        let granted = service
            .acquire(request(owner("m2")).with_wait_ms(1_000))
            .await
            .unwrap();
        assert_eq!(granted.owner().member, MemberId::new("m2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_unbounded_waiters() {
        let service = Arc::new(MemoryLockService::new());
        let _holder = service.acquire(request(owner("m1"))).await.unwrap();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acquire(request(owner("m2")).with_wait_ms(-1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        service.shutdown().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, GridError::Cancelled(_)));

        // New requests are refused after shutdown
        assert!(matches!(
            service.acquire(request(owner("m3"))).await,
            Err(GridError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let service = MemoryLockService::new();
        for (region, member) in [("/A", "m1"), ("/A", "m2"), ("/B", "m1")] {
            let key = LockKey::new(region, format!("key-{}", member));
            service
                .acquire(LockAcquireRequest::new(key, owner(member)))
                .await
                .unwrap();
        }

        let in_a = service
            .list(LockQuery {
                region: Some("/A".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(in_a.len(), 2);

        let of_m1 = service
            .list(LockQuery {
                member: Some(MemberId::new("m1")),
                ..Default::default()
            })
            .await;
        assert_eq!(of_m1.len(), 2);
        assert_eq!(service.get_stats().await.total_locks, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        let service = Arc::new(MemoryLockService::new());
        let value = Arc::new(Mutex::new(0u64));

        let mut tasks = Vec::new();
        for t in 0..8 {
            let service = service.clone();
            let value = value.clone();
            tasks.push(tokio::spawn(async move {
                let me = owner(&format!("m{}", t % 2));
                for _ in 0..25 {
                    let handle = service
                        .acquire(request(me.clone()).with_wait_ms(-1))
                        .await
                        .unwrap();
                    let read = *value.lock();
                    tokio::task::yield_now().await;
                    *value.lock() = read + 1;
                    service.release(&handle).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*value.lock(), 200);
        let stats = service.get_stats().await;
        assert_eq!(stats.total_acquisitions, 200);
        assert_eq!(stats.active_locks, 0);
    }

    #[tokio::test]
    async fn test_idle_slots_are_dropped_on_release() {
        let service = MemoryLockService::new();

        for i in 0..1000 {
            let key = LockKey::new("/ROOT/test", format!("KEY-{}", i));
            let handle = service
                .acquire(LockAcquireRequest::new(key, owner("m1")))
                .await
                .unwrap();
            service.release(&handle).await.unwrap();
        }

        assert_eq!(service.slots.len(), 0);
        assert_eq!(service.grantor.held.load(Ordering::Relaxed), 0);
        let stats = service.get_stats().await;
        assert_eq!(stats.total_releases, 1000);
        assert_eq!(stats.active_locks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_slots_are_dropped_after_timeout_and_departure() {
        let service = MemoryLockService::new();
        let holder = service.acquire(request(owner("m1"))).await.unwrap();
        assert_eq!(service.grantor.held.load(Ordering::Relaxed), 1);

        // A timed-out waiter leaves the held slot in place
        let _ = service
            .acquire(request(owner("m2")).with_wait_ms(10))
            .await
            .unwrap_err();
        assert_eq!(service.slots.len(), 1);

        assert_eq!(service.member_departed(&MemberId::new("m1")).await, 1);
        assert_eq!(holder.status(), LeaseStatus::Reclaimed);
        assert_eq!(service.slots.len(), 0);
        assert_eq!(service.grantor.held.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_kept_while_waiters_queue() {
        let service = Arc::new(MemoryLockService::new());
        let holder = service.acquire(request(owner("m1"))).await.unwrap();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acquire(request(owner("m2")).with_wait_ms(-1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        service.release(&holder).await.unwrap();
        let next = waiter.await.unwrap().unwrap();
        assert_eq!(service.slots.len(), 1);
        assert_eq!(service.grantor.held.load(Ordering::Relaxed), 1);

        service.release(&next).await.unwrap();
        assert_eq!(service.slots.len(), 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_lease_never_expires() {
        let service = MemoryLockService::new();
        let handle = service
            .acquire(request(owner("m1")).with_lease_ms(Some(u64::MAX)))
            .await
            .unwrap();
        assert!(handle.is_held());
        assert_eq!(MemoryLockService::expire_locks(&service.slots, &service.grantor), 0);
        assert!(service.is_locked(handle.key()).await);

        service.release(&handle).await.unwrap();
        assert_eq!(service.slots.len(), 0);
    }
}
