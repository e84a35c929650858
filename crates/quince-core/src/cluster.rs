//! In-process cluster: hosts members, installs views and routes peer traffic

use std::sync::Arc;

use dashmap::DashMap;
use quince_common::{GridError, MemberId, Result};
use quince_consistency::{DistributedLockService, MemoryLockService, ScopeRegistry};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{info, warn};

use crate::cache::{ClusterServices, GridCache};
use crate::model::CacheSettings;
use crate::service::member_event::{
    LockReclaimListener, MemberChangeEvent, MemberChangeEventPublisher, MembershipView,
    ScopeHostListener,
};
use crate::service::messenger::{LocalPeerMessenger, PeerEndpoint};

/// A cluster of members living in one process.
///
/// Stands in for the membership protocol and transport: joins and departures
/// install a new [`MembershipView`] and are published to listeners, which
/// reclaim the departed member's locks and prune it from scope records.
pub struct GridCluster {
    settings: CacheSettings,
    locks: Arc<MemoryLockService>,
    registry: Arc<ScopeRegistry>,
    messenger: Arc<LocalPeerMessenger>,
    publisher: MemberChangeEventPublisher,
    view_tx: watch::Sender<MembershipView>,
    members: DashMap<MemberId, Arc<GridCache>>,
    // serializes view changes
    roster: Mutex<()>,
}

impl GridCluster {
    pub async fn start(settings: CacheSettings) -> Self {
        let locks = match settings.lock_lease_ms {
            Some(_) => MemoryLockService::new().with_expiry_scan(settings.expiry_scan_interval_ms),
            None => MemoryLockService::new(),
        };
        let locks = Arc::new(locks);
        let registry = Arc::new(ScopeRegistry::new());

        let publisher = MemberChangeEventPublisher::new(settings.event_queue_size);
        publisher
            .register_listener(Arc::new(LockReclaimListener::new(locks.clone())))
            .await;
        publisher
            .register_listener(Arc::new(ScopeHostListener::new(registry.clone())))
            .await;
        publisher.start();

        let (view_tx, _) = watch::channel(MembershipView::default());
        info!(
            lock_timeout = settings.lock_timeout_secs,
            search_timeout = settings.search_timeout_secs,
            "Grid cluster started"
        );

        Self {
            settings,
            locks,
            registry,
            messenger: Arc::new(LocalPeerMessenger::new()),
            publisher,
            view_tx,
            members: DashMap::new(),
            roster: Mutex::new(()),
        }
    }

    /// Add a member and return its cache
    pub async fn join(&self, member: impl Into<MemberId>) -> Result<Arc<GridCache>> {
        let member = member.into();
        let _roster = self.roster.lock().await;
        if self.members.contains_key(&member) {
            return Err(GridError::IllegalArgument(format!(
                "member {} already joined",
                member
            )));
        }

        let cache = GridCache::new(member.clone(), self.services(), &self.settings);
        let endpoint: Arc<dyn PeerEndpoint> = cache.clone();
        self.messenger
            .register(member.clone(), Arc::downgrade(&endpoint));
        self.members.insert(member.clone(), cache.clone());

        self.view_tx
            .send_modify(|view| *view = view.with_member(member.clone()));
        let view = self.view();
        self.publisher
            .publish(MemberChangeEvent::member_join(member, view))
            .await;
        Ok(cache)
    }

    /// Graceful departure: the member closes its cache, then leaves the view
    pub async fn leave(&self, member: &MemberId) -> Result<()> {
        let cache = self.depart(member)?;
        cache.close();
        self.install_departure(member, false).await;
        Ok(())
    }

    /// Abrupt departure: the member stops without unpublishing anything and
    /// the rest of the cluster cleans up after it
    pub async fn crash(&self, member: &MemberId) -> Result<()> {
        let cache = self.depart(member)?;
        cache.halt();
        self.install_departure(member, true).await;
        Ok(())
    }

    pub fn view(&self) -> MembershipView {
        self.view_tx.borrow().clone()
    }

    pub fn member(&self, member: &MemberId) -> Option<Arc<GridCache>> {
        self.members.get(member).map(|c| c.clone())
    }

    pub fn lock_service(&self) -> Arc<MemoryLockService> {
        self.locks.clone()
    }

    pub fn scope_registry(&self) -> Arc<ScopeRegistry> {
        self.registry.clone()
    }

    pub fn messenger(&self) -> Arc<LocalPeerMessenger> {
        self.messenger.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemberChangeEvent> {
        self.publisher.subscribe()
    }

    /// Close every member and cancel all outstanding lock waits
    pub async fn shutdown(&self) {
        let members: Vec<MemberId> = self.members.iter().map(|m| m.key().clone()).collect();
        for member in members {
            if let Err(e) = self.leave(&member).await {
                warn!(member = %member, error = %e, "Member failed to leave");
            }
        }
        self.locks.shutdown().await;
        self.publisher.stop();
        info!("Grid cluster shut down");
    }

    fn services(&self) -> ClusterServices {
        ClusterServices {
            locks: self.locks.clone(),
            registry: self.registry.clone(),
            messenger: self.messenger.clone(),
            view: self.view_tx.subscribe(),
        }
    }

    fn depart(&self, member: &MemberId) -> Result<Arc<GridCache>> {
        self.members
            .remove(member)
            .map(|(_, cache)| cache)
            .ok_or_else(|| GridError::IllegalArgument(format!("member {} is not joined", member)))
    }

    async fn install_departure(&self, member: &MemberId, crashed: bool) {
        let _roster = self.roster.lock().await;
        self.messenger.deregister(member);
        self.view_tx
            .send_modify(|view| *view = view.without_member(member));

        let view = self.view();
        let event = if crashed {
            MemberChangeEvent::member_crash(member.clone(), view)
        } else {
            MemberChangeEvent::member_leave(member.clone(), view)
        };
        self.publisher.publish(event).await;
    }
}
