//! Per-member cache: region creation, lookup and the inbound peer endpoint

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use quince_common::{GridError, MemberId, Result, SEPARATOR, is_valid_region_name, root_path};
use quince_consistency::{DistributedLockService, ScopeRegistry};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::model::{CacheSettings, RegionAttributes};
use crate::region::Region;
use crate::service::loader::LoaderArbitrator;
use crate::service::member_event::MembershipView;
use crate::service::messenger::{EntryUpdate, PeerEndpoint, PeerMessenger, VersionedValue};
use crate::service::net_search::NetSearchCoordinator;
use crate::service::timeout::TimeoutPolicy;

/// Cluster-shared collaborators a member's cache is wired to
#[derive(Clone)]
pub struct ClusterServices {
    pub locks: Arc<dyn DistributedLockService>,
    pub registry: Arc<ScopeRegistry>,
    pub messenger: Arc<dyn PeerMessenger>,
    /// Views installed by the membership layer
    pub view: watch::Receiver<MembershipView>,
}

/// State shared by every region of one member
pub(crate) struct CacheContext {
    pub(crate) member: MemberId,
    pub(crate) locks: Arc<dyn DistributedLockService>,
    pub(crate) registry: Arc<ScopeRegistry>,
    pub(crate) messenger: Arc<dyn PeerMessenger>,
    pub(crate) timeouts: Arc<TimeoutPolicy>,
    pub(crate) arbitrator: LoaderArbitrator,
    pub(crate) lock_lease_ms: Option<u64>,
    view: watch::Receiver<MembershipView>,
}

impl CacheContext {
    pub(crate) fn view(&self) -> MembershipView {
        self.view.borrow().clone()
    }

    /// Other members in the current view that host `region`
    pub(crate) fn peers_hosting(&self, region: &str) -> Vec<MemberId> {
        let view = self.view.borrow();
        self.registry
            .hosts(region)
            .into_iter()
            .filter(|host| host != &self.member && view.contains(host))
            .collect()
    }
}

/// One member's cache
pub struct GridCache {
    ctx: Arc<CacheContext>,
    roots: DashMap<String, Arc<Region>>,
    self_ref: Weak<GridCache>,
    closed: AtomicBool,
}

impl GridCache {
    pub fn new(member: MemberId, services: ClusterServices, settings: &CacheSettings) -> Arc<Self> {
        let timeouts = Arc::new(TimeoutPolicy::new(
            settings.lock_timeout_secs,
            settings.search_timeout_secs,
        ));
        let search =
            NetSearchCoordinator::new(services.messenger.clone(), services.registry.clone());
        let arbitrator = LoaderArbitrator::new(
            member.clone(),
            services.locks.clone(),
            search,
            timeouts.clone(),
        );

        let ctx = Arc::new(CacheContext {
            member,
            locks: services.locks,
            registry: services.registry,
            messenger: services.messenger,
            timeouts,
            arbitrator,
            lock_lease_ms: settings.lock_lease_ms,
            view: services.view,
        });

        Arc::new_cyclic(|self_ref| Self {
            ctx,
            roots: DashMap::new(),
            self_ref: self_ref.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn member_id(&self) -> &MemberId {
        &self.ctx.member
    }

    /// The membership view currently installed
    pub fn view(&self) -> MembershipView {
        self.ctx.view()
    }

    pub fn set_lock_timeout(&self, seconds: u64) {
        self.ctx.timeouts.set_lock_timeout(seconds);
    }

    pub fn set_search_timeout(&self, seconds: u64) {
        self.ctx.timeouts.set_search_timeout(seconds);
    }

    pub fn lock_timeout(&self) -> Duration {
        self.ctx.timeouts.lock_timeout()
    }

    pub fn search_timeout(&self) -> Duration {
        self.ctx.timeouts.search_timeout()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Create a root region, checking its scope against the cluster
    pub fn create_root_region(&self, root: &str, attributes: RegionAttributes) -> Result<Arc<Region>> {
        self.check_open()?;
        check_name(root)?;

        let path = root_path(root);
        match self.roots.entry(root.to_string()) {
            Entry::Occupied(_) => Err(GridError::RegionExists(path)),
            Entry::Vacant(entry) => {
                self.ctx
                    .registry
                    .register(&path, attributes.scope, &self.ctx.member)?;
                let region = Region::new(
                    root,
                    path,
                    attributes,
                    self.ctx.clone(),
                    self.self_ref.clone(),
                    None,
                );
                entry.insert(region.clone());
                info!(
                    region = %region.full_path(),
                    scope = %attributes.scope,
                    member = %self.ctx.member,
                    "Root region created"
                );
                Ok(region)
            }
        }
    }

    /// Create `name` below `root`, creating the root with the same attributes
    /// when this member does not host it yet.
    ///
    /// The root is validated first. If the root was created by this call and
    /// the subregion is then rejected, the root is rolled back as well.
    pub fn create_region(
        &self,
        root: &str,
        name: &str,
        attributes: RegionAttributes,
    ) -> Result<Arc<Region>> {
        self.check_open()?;
        check_name(root)?;
        check_name(name)?;

        let (root_region, created_root) = match self.get_root_region(root) {
            Some(existing) => (existing, false),
            None => match self.create_root_region(root, attributes) {
                Ok(created) => (created, true),
                Err(GridError::RegionExists(_)) => match self.get_root_region(root) {
                    Some(existing) => (existing, false),
                    None => return Err(GridError::RegionNotFound(root_path(root))),
                },
                Err(e) => return Err(e),
            },
        };

        match root_region.create_subregion(name, attributes) {
            Ok(region) => Ok(region),
            Err(e) => {
                if created_root {
                    debug!(root = %root, error = %e, "Rolling back root region");
                    root_region.close();
                }
                Err(e)
            }
        }
    }

    pub fn get_root_region(&self, root: &str) -> Option<Arc<Region>> {
        self.roots.get(root).map(|r| r.clone())
    }

    pub fn root_regions(&self) -> Vec<Arc<Region>> {
        self.roots.iter().map(|r| r.value().clone()).collect()
    }

    /// Look a region up by its full path, e.g. `/ROOT/orders`
    pub fn get_region(&self, path: &str) -> Option<Arc<Region>> {
        let mut segments = path.split(SEPARATOR).filter(|s| !s.is_empty());
        let mut region = self.get_root_region(segments.next()?)?;
        for segment in segments {
            region = region.get_subregion(segment)?;
        }
        Some(region)
    }

    /// Close every region this member hosts
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for root in self.root_regions() {
            root.teardown(true);
        }
        self.roots.clear();
        info!(member = %self.ctx.member, "Cache closed");
    }

    /// Stop serving without unpublishing anything, as a killed process would
    pub(crate) fn halt(&self) {
        self.closed.store(true, Ordering::Release);
        for root in self.root_regions() {
            root.teardown(false);
        }
        self.roots.clear();
    }

    pub(crate) fn detach_root(&self, root: &str) {
        self.roots.remove(root);
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(GridError::Cancelled(format!(
                "cache of {} is closed",
                self.ctx.member
            )));
        }
        Ok(())
    }
}

impl PeerEndpoint for GridCache {
    fn on_net_search(&self, region: &str, key: &str) -> Option<VersionedValue> {
        self.get_region(region)?.local_versioned(key)
    }

    fn on_entry_update(&self, update: EntryUpdate) {
        match self.get_region(&update.region) {
            Some(region) => region.apply_remote(update),
            None => debug!(region = %update.region, "Update for region not hosted here"),
        }
    }

    fn on_region_destroyed(&self, region: &str) {
        match self.get_region(region) {
            Some(local) => {
                local.detach();
                local.teardown(false);
                info!(region = %region, member = %self.ctx.member, "Region destroyed by peer");
            }
            None => warn!(region = %region, "Destroy for region not hosted here"),
        }
    }
}

impl std::fmt::Debug for GridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridCache")
            .field("member", &self.ctx.member)
            .field("roots", &self.roots.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_name(name: &str) -> Result<()> {
    if !is_valid_region_name(name) {
        return Err(GridError::IllegalArgument(format!(
            "invalid region name '{}'",
            name
        )));
    }
    Ok(())
}
