// Member change event handling
// Installs membership views and notifies listeners of joins and departures

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quince_common::MemberId;
use quince_consistency::{DistributedLockService, ScopeRegistry};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

/// A versioned roster of the members currently in the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipView {
    /// Monotonically increasing per installed view
    pub view_id: u64,
    /// Members in join order
    pub members: Vec<MemberId>,
}

impl MembershipView {
    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The view that follows this one with `member` added
    pub fn with_member(&self, member: MemberId) -> Self {
        let mut members = self.members.clone();
        if !members.contains(&member) {
            members.push(member);
        }
        Self {
            view_id: self.view_id + 1,
            members,
        }
    }

    /// The view that follows this one with `member` removed
    pub fn without_member(&self, member: &MemberId) -> Self {
        Self {
            view_id: self.view_id + 1,
            members: self
                .members
                .iter()
                .filter(|m| *m != member)
                .cloned()
                .collect(),
        }
    }
}

/// Type of member change event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberChangeType {
    /// A new member joined the cluster
    MemberJoin,
    /// A member left the cluster after closing its cache
    MemberLeave,
    /// A member was removed from the view without closing its cache
    MemberCrash,
}

impl MemberChangeType {
    /// Whether the member is gone from the view
    pub fn is_departure(&self) -> bool {
        matches!(
            self,
            MemberChangeType::MemberLeave | MemberChangeType::MemberCrash
        )
    }
}

impl std::fmt::Display for MemberChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberChangeType::MemberJoin => write!(f, "MEMBER_JOIN"),
            MemberChangeType::MemberLeave => write!(f, "MEMBER_LEAVE"),
            MemberChangeType::MemberCrash => write!(f, "MEMBER_CRASH"),
        }
    }
}

/// Member change event
#[derive(Clone, Debug)]
pub struct MemberChangeEvent {
    /// Type of change
    pub change_type: MemberChangeType,
    /// The affected member
    pub member: MemberId,
    /// View installed by this change
    pub view: MembershipView,
    /// Timestamp of the event
    pub timestamp: i64,
}

impl MemberChangeEvent {
    fn new(change_type: MemberChangeType, member: MemberId, view: MembershipView) -> Self {
        Self {
            change_type,
            member,
            view,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn member_join(member: MemberId, view: MembershipView) -> Self {
        Self::new(MemberChangeType::MemberJoin, member, view)
    }

    pub fn member_leave(member: MemberId, view: MembershipView) -> Self {
        Self::new(MemberChangeType::MemberLeave, member, view)
    }

    pub fn member_crash(member: MemberId, view: MembershipView) -> Self {
        Self::new(MemberChangeType::MemberCrash, member, view)
    }
}

/// Trait for handling member change events
#[async_trait::async_trait]
pub trait MemberChangeListener: Send + Sync {
    /// Called when a member change event occurs
    async fn on_member_change(&self, event: &MemberChangeEvent);
}

/// Member change event publisher
/// Broadcasts events to subscribers and invokes listeners in registration order
pub struct MemberChangeEventPublisher {
    broadcast_tx: broadcast::Sender<MemberChangeEvent>,
    listeners: RwLock<Vec<Arc<dyn MemberChangeListener>>>,
    running: AtomicBool,
}

impl MemberChangeEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));

        Self {
            broadcast_tx,
            listeners: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!("Starting member change event publisher");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Stopped member change event publisher");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn register_listener(&self, listener: Arc<dyn MemberChangeListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!(total = listeners.len(), "Registered member change listener");
    }

    /// Publish an event; listeners have all run when this returns
    pub async fn publish(&self, event: MemberChangeEvent) {
        if !self.is_running() {
            return;
        }

        info!(
            change = %event.change_type,
            member = %event.member,
            view_id = event.view.view_id,
            "Publishing member change event"
        );

        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_member_change(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemberChangeEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// Reclaims the lock tokens of departed members
pub struct LockReclaimListener {
    locks: Arc<dyn DistributedLockService>,
}

impl LockReclaimListener {
    pub fn new(locks: Arc<dyn DistributedLockService>) -> Self {
        Self { locks }
    }
}

#[async_trait::async_trait]
impl MemberChangeListener for LockReclaimListener {
    async fn on_member_change(&self, event: &MemberChangeEvent) {
        if !event.change_type.is_departure() {
            return;
        }
        let reclaimed = self.locks.member_departed(&event.member).await;
        if reclaimed > 0 && event.change_type == MemberChangeType::MemberCrash {
            warn!(
                member = %event.member,
                count = reclaimed,
                "Crashed member still held locks"
            );
        }
    }
}

/// Removes departed members from the published scope records
pub struct ScopeHostListener {
    registry: Arc<ScopeRegistry>,
}

impl ScopeHostListener {
    pub fn new(registry: Arc<ScopeRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl MemberChangeListener for ScopeHostListener {
    async fn on_member_change(&self, event: &MemberChangeEvent) {
        if event.change_type.is_departure() {
            self.registry.member_departed(&event.member);
        }
    }
}

#[cfg(test)]
mod tests {
    use quince_common::Scope;
    use quince_consistency::{LockAcquireRequest, LockKey, LockOwner, MemoryLockService};

    use super::*;

    fn m(id: &str) -> MemberId {
        MemberId::new(id)
    }

    #[test]
    fn test_view_transitions() {
        let view = MembershipView::default()
            .with_member(m("a"))
            .with_member(m("b"))
            .with_member(m("a"));
        assert_eq!(view.view_id, 3);
        assert_eq!(view.members, vec![m("a"), m("b")]);

        let next = view.without_member(&m("a"));
        assert_eq!(next.view_id, 4);
        assert!(!next.contains(&m("a")));
        assert_eq!(next.len(), 1);
    }

    #[tokio::test]
    async fn test_event_publisher() {
        let publisher = MemberChangeEventPublisher::new(16);
        publisher.start();
        let mut receiver = publisher.subscribe();

        let view = MembershipView::default().with_member(m("a"));
        publisher
            .publish(MemberChangeEvent::member_join(m("a"), view))
            .await;

        let received = receiver.try_recv().unwrap();
        assert_eq!(received.change_type, MemberChangeType::MemberJoin);
        assert_eq!(received.view.view_id, 1);
    }

    #[tokio::test]
    async fn test_stopped_publisher_drops_events() {
        let publisher = MemberChangeEventPublisher::new(16);
        let mut receiver = publisher.subscribe();

        publisher
            .publish(MemberChangeEvent::member_join(m("a"), MembershipView::default()))
            .await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_departure_listeners() {
        let locks = Arc::new(MemoryLockService::new());
        let registry = Arc::new(ScopeRegistry::new());
        registry.register("/ROOT/r", Scope::Global, &m("a")).unwrap();

        let handle = locks
            .acquire(LockAcquireRequest::new(
                LockKey::new("/ROOT/r", "KEY"),
                LockOwner::next(m("a")),
            ))
            .await
            .unwrap();

        let publisher = MemberChangeEventPublisher::new(16);
        publisher.start();
        publisher
            .register_listener(Arc::new(LockReclaimListener::new(locks.clone())))
            .await;
        publisher
            .register_listener(Arc::new(ScopeHostListener::new(registry.clone())))
            .await;

        let view = MembershipView::default().with_member(m("a"));
        publisher
            .publish(MemberChangeEvent::member_crash(
                m("a"),
                view.without_member(&m("a")),
            ))
            .await;

        assert!(!handle.is_held());
        assert!(registry.lookup("/ROOT/r").is_none());
    }

    #[test]
    fn test_change_type_display() {
        assert_eq!(MemberChangeType::MemberCrash.to_string(), "MEMBER_CRASH");
        assert!(MemberChangeType::MemberLeave.is_departure());
        assert!(!MemberChangeType::MemberJoin.is_departure());
    }
}
