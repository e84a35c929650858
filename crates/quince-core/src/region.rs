//! Regions and per-entry distributed locks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use quince_common::{
    DataPolicy, GridError, MemberId, Result, SEPARATOR, Scope, is_valid_region_name,
};
use quince_consistency::{LockAcquireRequest, LockHandle, LockKey, LockOwner};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheContext, GridCache};
use crate::model::{EntryVersion, RegionAttributes};
use crate::service::loader::{CacheLoader, LoadTarget};
use crate::service::member_event::MembershipView;
use crate::service::messenger::{EntryOperation, EntryUpdate, VersionedValue};

#[derive(Clone, Debug)]
struct StoredEntry {
    /// `None` once invalidated
    value: Option<Value>,
    version: EntryVersion,
}

/// A named key/value partition hosted by one member
pub struct Region {
    name: String,
    full_path: String,
    attributes: RegionAttributes,
    ctx: Arc<CacheContext>,
    cache: Weak<GridCache>,
    parent: Option<Weak<Region>>,
    self_ref: Weak<Region>,
    entries: DashMap<String, StoredEntry>,
    loader: RwLock<Option<Arc<dyn CacheLoader>>>,
    subregions: DashMap<String, Arc<Region>>,
    destroyed: AtomicBool,
}

impl Region {
    pub(crate) fn new(
        name: &str,
        full_path: String,
        attributes: RegionAttributes,
        ctx: Arc<CacheContext>,
        cache: Weak<GridCache>,
        parent: Option<Weak<Region>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.to_string(),
            full_path,
            attributes,
            ctx,
            cache,
            parent,
            self_ref: self_ref.clone(),
            entries: DashMap::new(),
            loader: RwLock::new(None),
            subregions: DashMap::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn attributes(&self) -> RegionAttributes {
        self.attributes
    }

    pub fn scope(&self) -> Scope {
        self.attributes.scope
    }

    pub fn member_id(&self) -> &MemberId {
        &self.ctx.member
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Read `key`: local store, then peers, then the loader
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_open()?;
        check_key(key)?;
        let resolved = self.ctx.arbitrator.resolve(self, key, None).await?;
        Ok(resolved.value)
    }

    /// Read `key` while holding its entry lock
    pub async fn get_locked(&self, lock: &EntryLock, key: &str) -> Result<Option<Value>> {
        self.check_open()?;
        check_key(key)?;
        let handle = lock.covering(&self.full_path, key)?;
        let resolved = self
            .ctx
            .arbitrator
            .resolve(self, key, Some(&handle))
            .await?;
        Ok(resolved.value)
    }

    /// Write `key`, returning the previous local value.
    ///
    /// On a GLOBAL region the entry lock is taken for the duration of the
    /// write, waiting at most the cache's lock timeout. Every call takes a
    /// fresh lock owner, so while an [`EntryLock`] on the same key is held,
    /// even by this member, `put` waits for it and fails with
    /// [`GridError::LockTimeout`]. Write through [`Region::put_locked`] instead.
    pub async fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.write(key, EntryOperation::Put(value), None).await
    }

    /// Write `key` while holding its entry lock
    pub async fn put_locked(
        &self,
        lock: &EntryLock,
        key: &str,
        value: Value,
    ) -> Result<Option<Value>> {
        self.write(key, EntryOperation::Put(value), Some(lock)).await
    }

    /// Remove `key` everywhere, returning the previous local value
    pub async fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.write(key, EntryOperation::Remove, None).await
    }

    /// Drop the value of `key` everywhere but keep the entry
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.write(key, EntryOperation::Invalidate, None)
            .await
            .map(|_| ())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn contains_value_for_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.value.is_some())
    }

    /// Locally held keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install or clear the loader, returning the previous one
    pub fn set_cache_loader(
        &self,
        loader: Option<Arc<dyn CacheLoader>>,
    ) -> Option<Arc<dyn CacheLoader>> {
        std::mem::replace(&mut *self.loader.write(), loader)
    }

    /// Cluster-wide lock on one entry. Only GLOBAL regions support it.
    ///
    /// The lock is not reentrant across calls: plain [`Region::put`] and
    /// [`Region::remove`] on a held key queue behind it. Write through
    /// [`Region::put_locked`] while holding it.
    pub fn get_distributed_lock(&self, key: &str) -> Result<EntryLock> {
        self.check_open()?;
        check_key(key)?;
        if !self.attributes.scope.is_global() {
            return Err(GridError::IllegalArgument(format!(
                "distributed locks require GLOBAL scope, {} is {}",
                self.full_path, self.attributes.scope
            )));
        }
        Ok(EntryLock {
            key: LockKey::new(&self.full_path, key),
            owner: LockOwner::next(self.ctx.member.clone()),
            ctx: self.ctx.clone(),
            state: Mutex::new(None),
        })
    }

    pub fn get_subregion(&self, name: &str) -> Option<Arc<Region>> {
        self.subregions.get(name).map(|r| r.clone())
    }

    pub fn subregions(&self) -> Vec<Arc<Region>> {
        self.subregions.iter().map(|r| r.value().clone()).collect()
    }

    /// Create a region below this one, published under `full_path/name`
    pub fn create_subregion(&self, name: &str, attributes: RegionAttributes) -> Result<Arc<Region>> {
        self.check_open()?;
        if !is_valid_region_name(name) {
            return Err(GridError::IllegalArgument(format!(
                "invalid region name '{}'",
                name
            )));
        }

        let path = format!("{}{}{}", self.full_path, SEPARATOR, name);
        match self.subregions.entry(name.to_string()) {
            Entry::Occupied(_) => Err(GridError::RegionExists(path)),
            Entry::Vacant(entry) => {
                self.ctx
                    .registry
                    .register(&path, attributes.scope, &self.ctx.member)?;
                let region = Region::new(
                    name,
                    path,
                    attributes,
                    self.ctx.clone(),
                    self.cache.clone(),
                    Some(self.self_ref.clone()),
                );
                entry.insert(region.clone());
                info!(
                    region = %region.full_path,
                    scope = %attributes.scope,
                    member = %self.ctx.member,
                    "Region created"
                );
                Ok(region)
            }
        }
    }

    /// Close this member's copy of the region and its subregions
    pub fn close(&self) {
        self.detach();
        self.teardown(true);
    }

    /// Destroy the region on every member hosting it
    pub async fn destroy_region(&self) -> Result<()> {
        self.check_open()?;

        let peers = self.ctx.peers_hosting(&self.full_path);
        self.unpublish();
        self.detach();
        self.teardown(false);

        for peer in peers {
            if let Err(e) = self
                .ctx
                .messenger
                .region_destroyed(&peer, &self.full_path)
                .await
            {
                warn!(region = %self.full_path, peer = %peer, error = %e, "Failed to notify peer of destroy");
            }
        }
        info!(region = %self.full_path, "Region destroyed");
        Ok(())
    }

    /// Apply an update distributed by another member
    pub(crate) fn apply_remote(&self, update: EntryUpdate) {
        let policy = self.attributes.data_policy;
        if self.is_destroyed() || !policy.with_storage() {
            return;
        }

        let EntryUpdate {
            key,
            operation,
            version,
            ..
        } = update;
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if self.attributes.concurrency_checks_enabled && entry.get().version >= version {
                    debug!(region = %self.full_path, key = %entry.key(), "Ignoring stale update");
                    return;
                }
                match operation {
                    EntryOperation::Put(value) => {
                        *entry.get_mut() = StoredEntry {
                            value: Some(value),
                            version,
                        };
                    }
                    EntryOperation::Invalidate => {
                        *entry.get_mut() = StoredEntry {
                            value: None,
                            version,
                        };
                    }
                    EntryOperation::Remove => {
                        entry.remove();
                    }
                }
            }
            Entry::Vacant(entry) => {
                if let EntryOperation::Put(value) = operation
                    && policy.accepts_all_updates()
                {
                    entry.insert(StoredEntry {
                        value: Some(value),
                        version,
                    });
                }
            }
        }
    }

    pub(crate) fn local_versioned(&self, key: &str) -> Option<VersionedValue> {
        if self.is_destroyed() {
            return None;
        }
        self.entries.get(key).and_then(|entry| {
            entry.value.clone().map(|value| VersionedValue {
                value,
                version: entry.version.clone(),
            })
        })
    }

    /// Remove this region from its parent or from the cache
    pub(crate) fn detach(&self) {
        match &self.parent {
            Some(parent) => {
                if let Some(parent) = parent.upgrade() {
                    parent.subregions.remove(&self.name);
                }
            }
            None => {
                if let Some(cache) = self.cache.upgrade() {
                    cache.detach_root(&self.name);
                }
            }
        }
    }

    /// Mark the region and its subregions destroyed and release local state
    pub(crate) fn teardown(&self, unregister: bool) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        for sub in self.subregions() {
            sub.teardown(unregister);
        }
        self.subregions.clear();

        if unregister {
            self.ctx
                .registry
                .unregister(&self.full_path, &self.ctx.member);
        }
        if let Some(loader) = self.loader.write().take() {
            loader.close();
        }
        self.entries.clear();
        debug!(region = %self.full_path, member = %self.ctx.member, "Region closed");
    }

    fn unpublish(&self) {
        for sub in self.subregions() {
            sub.unpublish();
        }
        self.ctx.registry.remove(&self.full_path);
    }

    fn check_open(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(GridError::RegionDestroyed(self.full_path.clone()));
        }
        Ok(())
    }

    async fn write(
        &self,
        key: &str,
        operation: EntryOperation,
        held: Option<&EntryLock>,
    ) -> Result<Option<Value>> {
        self.check_open()?;
        check_key(key)?;

        if let Some(lock) = held {
            lock.covering(&self.full_path, key)?;
            return self.apply_and_distribute(key, operation).await;
        }
        if !self.attributes.scope.is_global() {
            return self.apply_and_distribute(key, operation).await;
        }

        let request = LockAcquireRequest::new(
            LockKey::new(&self.full_path, key),
            LockOwner::next(self.ctx.member.clone()),
        )
        .with_wait_ms(self.ctx.timeouts.lock_wait_ms())
        .with_lease_ms(self.ctx.lock_lease_ms);
        let handle = self.ctx.locks.acquire(request).await?;

        let result = self.apply_and_distribute(key, operation).await;
        if let Err(e) = self.ctx.locks.release(&handle).await {
            warn!(region = %self.full_path, key = %key, error = %e, "Releasing write lock failed");
        }
        result
    }

    async fn apply_and_distribute(
        &self,
        key: &str,
        operation: EntryOperation,
    ) -> Result<Option<Value>> {
        let previous_version = self.entries.get(key).map(|e| e.version.clone());
        let version = EntryVersion::next(previous_version.as_ref(), &self.ctx.member);
        let previous = self.apply_local(key, &operation, version.clone());

        self.distribute(EntryUpdate {
            region: self.full_path.clone(),
            key: key.to_string(),
            operation,
            version,
        })
        .await;
        Ok(previous)
    }

    fn apply_local(
        &self,
        key: &str,
        operation: &EntryOperation,
        version: EntryVersion,
    ) -> Option<Value> {
        if self.attributes.data_policy == DataPolicy::Empty {
            return None;
        }

        match operation {
            EntryOperation::Put(value) => self
                .entries
                .insert(
                    key.to_string(),
                    StoredEntry {
                        value: Some(value.clone()),
                        version,
                    },
                )
                .and_then(|old| old.value),
            EntryOperation::Invalidate => self.entries.get_mut(key).and_then(|mut entry| {
                entry.version = version;
                entry.value.take()
            }),
            EntryOperation::Remove => self.entries.remove(key).and_then(|(_, old)| old.value),
        }
    }

    async fn distribute(&self, update: EntryUpdate) {
        let scope = self.attributes.scope;
        if scope.is_local() {
            return;
        }
        let peers = self.ctx.peers_hosting(&self.full_path);
        if peers.is_empty() {
            return;
        }

        if scope.is_acknowledged() {
            let messenger = &self.ctx.messenger;
            let sends = peers.iter().map(|peer| {
                let update = update.clone();
                async move { (peer, messenger.replicate(peer, update).await) }
            });
            for (peer, result) in futures::future::join_all(sends).await {
                if let Err(e) = result {
                    warn!(region = %self.full_path, peer = %peer, error = %e, "Replication failed");
                }
            }
        } else {
            for peer in peers {
                let messenger = self.ctx.messenger.clone();
                let update = update.clone();
                tokio::spawn(async move {
                    if let Err(e) = messenger.replicate(&peer, update).await {
                        debug!(peer = %peer, error = %e, "Unacknowledged replication failed");
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("full_path", &self.full_path)
            .field("attributes", &self.attributes)
            .field("member", &self.ctx.member)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl LoadTarget for Region {
    fn path(&self) -> &str {
        &self.full_path
    }

    fn scope(&self) -> Scope {
        self.attributes.scope
    }

    fn local_value(&self, key: &str) -> Option<Value> {
        self.entries.get(key).and_then(|entry| entry.value.clone())
    }

    fn loader(&self) -> Option<Arc<dyn CacheLoader>> {
        self.loader.read().clone()
    }

    fn view(&self) -> MembershipView {
        self.ctx.view()
    }

    fn cache_fetched(&self, key: &str, value: &Value, version: EntryVersion) {
        if !self.attributes.data_policy.with_storage() {
            return;
        }
        let fetched = StoredEntry {
            value: Some(value.clone()),
            version,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(fetched);
            }
            Entry::Occupied(mut entry) => {
                if entry.get().value.is_none() || entry.get().version < fetched.version {
                    entry.insert(fetched);
                }
            }
        }
    }

    async fn store_loaded(&self, key: &str, value: Value) -> Result<()> {
        self.apply_and_distribute(key, EntryOperation::Put(value))
            .await
            .map(|_| ())
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(GridError::IllegalArgument("key must not be empty".to_string()));
    }
    Ok(())
}

struct HeldLock {
    handle: LockHandle,
    depth: u32,
}

/// Distributed lock on one entry of a GLOBAL region.
///
/// Reentrant: every successful `lock`/`try_lock` must be paired with an
/// `unlock`. A lock belongs to the task that obtained it and should not be
/// shared between concurrent tasks; call
/// [`Region::get_distributed_lock`] once per task instead.
pub struct EntryLock {
    key: LockKey,
    owner: LockOwner,
    ctx: Arc<CacheContext>,
    state: Mutex<Option<HeldLock>>,
}

impl EntryLock {
    pub fn region(&self) -> &str {
        &self.key.region
    }

    pub fn key(&self) -> &str {
        &self.key.key
    }

    /// Wait until the lock is granted, the owner departs or the lock
    /// service shuts down
    pub async fn lock(&self) -> Result<()> {
        self.acquire(-1).await
    }

    /// Wait at most `wait_ms` (negative waits without limit, 0 does not wait).
    /// Returns false when the wait elapsed.
    pub async fn try_lock(&self, wait_ms: i64) -> Result<bool> {
        match self.acquire(wait_ms).await {
            Ok(()) => Ok(true),
            Err(GridError::LockTimeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn unlock(&self) -> Result<()> {
        let handle = {
            let mut state = self.state.lock();
            let Some(held) = state.as_mut() else {
                return Err(GridError::NotLockOwner {
                    region: self.key.region.clone(),
                    key: self.key.key.clone(),
                });
            };
            if held.depth > 1 {
                held.depth -= 1;
                return Ok(());
            }
            state.take().map(|held| held.handle)
        };

        if let Some(handle) = handle {
            self.ctx.locks.release(&handle).await?;
        }
        Ok(())
    }

    /// Whether the lock is currently held through this object
    pub fn is_held(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|held| held.handle.is_held())
    }

    async fn acquire(&self, wait_ms: i64) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(held) = state.as_mut()
                && held.handle.is_held()
            {
                held.depth += 1;
                return Ok(());
            }
            // the previous grant was reclaimed
            *state = None;
        }

        let request = LockAcquireRequest::new(self.key.clone(), self.owner.clone())
            .with_wait_ms(wait_ms)
            .with_lease_ms(self.ctx.lock_lease_ms);
        let handle = self.ctx.locks.acquire(request).await?;
        debug!(lock = %self.key, owner = %self.owner, "Entry lock acquired");

        *self.state.lock() = Some(HeldLock { handle, depth: 1 });
        Ok(())
    }

    /// The live handle, provided this lock covers `key` in `region`
    fn covering(&self, region: &str, key: &str) -> Result<LockHandle> {
        let not_owner = || GridError::NotLockOwner {
            region: region.to_string(),
            key: key.to_string(),
        };
        if self.key.region != region || self.key.key != key {
            return Err(not_owner());
        }
        self.state
            .lock()
            .as_ref()
            .filter(|held| held.handle.is_held())
            .map(|held| held.handle.clone())
            .ok_or_else(not_owner)
    }
}

impl std::fmt::Debug for EntryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("held", &self.is_held())
            .finish()
    }
}
