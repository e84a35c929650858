// Cache loading
// Decides how a read miss is satisfied and serializes loader invocations

use std::sync::Arc;
use std::time::Duration;

use quince_common::{GridError, MemberId, Result, Scope};
use quince_consistency::{DistributedLockService, LockAcquireRequest, LockHandle, LockKey, LockOwner};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::member_event::MembershipView;
use super::net_search::{NetSearchCoordinator, NetSearchRequest, SearchOutcome};
use super::timeout::TimeoutPolicy;
use crate::model::EntryVersion;

/// Arguments handed to a loader
#[derive(Clone, Debug)]
pub struct LoaderHelper {
    /// Full path of the region being read
    pub region: String,
    pub key: String,
    /// Member the load runs on
    pub member: MemberId,
}

/// Produces a value for a key no member holds
#[async_trait::async_trait]
pub trait CacheLoader: Send + Sync {
    /// Return `None` when there is no value for the key
    async fn load(&self, helper: &LoaderHelper) -> anyhow::Result<Option<Value>>;

    /// Called when the owning region is closed
    fn close(&self) {}
}

/// Adapts a synchronous closure into a [`CacheLoader`]
pub struct FnLoader<F>(pub F);

#[async_trait::async_trait]
impl<F> CacheLoader for FnLoader<F>
where
    F: Fn(&LoaderHelper) -> anyhow::Result<Option<Value>> + Send + Sync,
{
    async fn load(&self, helper: &LoaderHelper) -> anyhow::Result<Option<Value>> {
        (self.0)(helper)
    }
}

/// What to do about a read, given what is known so far
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissAction {
    /// Local hit: never search, never load
    ReturnLocal,
    /// A peer had the value: the loader is not invoked
    ReturnRemote,
    /// Nobody has it and there is no loader: no lock is taken
    ReturnNone,
    /// Nobody has it: invoke the loader once, under the entry lock when required
    Load,
}

impl MissAction {
    pub fn decide(local_hit: bool, remote_found: bool, has_loader: bool) -> Self {
        match (local_hit, remote_found, has_loader) {
            (true, _, _) => MissAction::ReturnLocal,
            (false, true, _) => MissAction::ReturnRemote,
            (false, false, false) => MissAction::ReturnNone,
            (false, false, true) => MissAction::Load,
        }
    }
}

/// Where a resolved value came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueSource {
    Local,
    Remote(MemberId),
    Loaded,
    Missing,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub value: Option<Value>,
    pub source: ValueSource,
}

impl Resolution {
    fn new(value: Option<Value>, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// The region a read is resolved against
#[async_trait::async_trait]
pub trait LoadTarget: Send + Sync {
    fn path(&self) -> &str;

    fn scope(&self) -> Scope;

    fn local_value(&self, key: &str) -> Option<Value>;

    fn loader(&self) -> Option<Arc<dyn CacheLoader>>;

    fn view(&self) -> MembershipView;

    /// Keep a value fetched from a peer, without distributing it
    fn cache_fetched(&self, key: &str, value: &Value, version: EntryVersion);

    /// Store a freshly loaded value and distribute it to the other hosts
    async fn store_loaded(&self, key: &str, value: Value) -> Result<()>;
}

/// Resolves reads: local store, then peers, then the loader
pub struct LoaderArbitrator {
    member: MemberId,
    locks: Arc<dyn DistributedLockService>,
    search: NetSearchCoordinator,
    timeouts: Arc<TimeoutPolicy>,
}

impl LoaderArbitrator {
    pub fn new(
        member: MemberId,
        locks: Arc<dyn DistributedLockService>,
        search: NetSearchCoordinator,
        timeouts: Arc<TimeoutPolicy>,
    ) -> Self {
        Self {
            member,
            locks,
            search,
            timeouts,
        }
    }

    /// Resolve `key` in `target`.
    ///
    /// `held` is the caller's own entry lock, if it holds one; loading under it
    /// does not take the lock again.
    pub async fn resolve(
        &self,
        target: &dyn LoadTarget,
        key: &str,
        held: Option<&LockHandle>,
    ) -> Result<Resolution> {
        if let Some(value) = target.local_value(key) {
            return Ok(Resolution::new(Some(value), ValueSource::Local));
        }

        if let Some(found) = self.search_peers(target, key).await {
            return Ok(found);
        }

        let Some(loader) = target.loader() else {
            debug!(region = %target.path(), key = %key, "Miss with no loader");
            return Ok(Resolution::new(None, ValueSource::Missing));
        };

        let lock_key = LockKey::new(target.path(), key);
        let already_held = held.is_some_and(|h| h.is_held() && h.key() == &lock_key);
        if !target.scope().is_global() || already_held {
            return self.load_once(target, key, loader.as_ref()).await;
        }

        let handle = self.acquire_for_load(lock_key).await?;
        let result = self.load_once(target, key, loader.as_ref()).await;
        if let Err(e) = self.locks.release(&handle).await {
            warn!(region = %target.path(), key = %key, error = %e, "Releasing load lock failed");
        }
        result
    }

    /// Re-check under the lock, then load if still missing
    async fn load_once(
        &self,
        target: &dyn LoadTarget,
        key: &str,
        loader: &dyn CacheLoader,
    ) -> Result<Resolution> {
        let local = target.local_value(key);
        let remote = match local {
            Some(_) => None,
            None => self.search_peers(target, key).await,
        };

        match MissAction::decide(local.is_some(), remote.is_some(), true) {
            MissAction::ReturnLocal => return Ok(Resolution::new(local, ValueSource::Local)),
            MissAction::ReturnRemote => {
                if let Some(found) = remote {
                    return Ok(found);
                }
            }
            MissAction::ReturnNone | MissAction::Load => {}
        }

        let helper = LoaderHelper {
            region: target.path().to_string(),
            key: key.to_string(),
            member: self.member.clone(),
        };
        metrics::counter!("quince_loader_invocations_total").increment(1);
        let loaded = loader
            .load(&helper)
            .await
            .map_err(|e| GridError::LoaderFailed {
                region: helper.region.clone(),
                key: helper.key.clone(),
                reason: format!("{:#}", e),
            })?;

        match loaded {
            Some(value) => {
                target.store_loaded(key, value.clone()).await?;
                debug!(region = %target.path(), key = %key, "Loaded value");
                Ok(Resolution::new(Some(value), ValueSource::Loaded))
            }
            None => Ok(Resolution::new(None, ValueSource::Missing)),
        }
    }

    async fn search_peers(&self, target: &dyn LoadTarget, key: &str) -> Option<Resolution> {
        let request = NetSearchRequest {
            region: target.path().to_string(),
            key: key.to_string(),
            requester: self.member.clone(),
            deadline: search_deadline(self.timeouts.search_timeout()),
        };

        match self.search.search(&request, &target.view()).await {
            SearchOutcome::Found {
                value,
                version,
                from,
            } => {
                target.cache_fetched(key, &value, version);
                Some(Resolution::new(Some(value), ValueSource::Remote(from)))
            }
            SearchOutcome::NotFound => None,
        }
    }

    async fn acquire_for_load(&self, lock_key: LockKey) -> Result<LockHandle> {
        let request = LockAcquireRequest::new(lock_key, LockOwner::next(self.member.clone()))
            .with_wait_ms(self.timeouts.search_wait_ms());

        self.locks.acquire(request).await.map_err(|e| match e {
            GridError::LockTimeout {
                region,
                key,
                waited_ms,
            } => GridError::SearchTimeout {
                region,
                key,
                waited_ms,
            },
            other => other,
        })
    }
}

/// Deadline for a peer search; falls back to the furthest policy bound
/// when the timeout does not fit after `now`
fn search_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(Duration::from_secs(super::timeout::MAX_TIMEOUT_SECS)))
        .unwrap_or(now)
}
