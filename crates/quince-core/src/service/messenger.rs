// Peer messaging
// Transport seam between members; the in-process messenger routes calls
// directly to the addressed member's cache

use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use quince_common::{GridError, MemberId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::model::EntryVersion;

/// Change applied to one entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryOperation {
    Put(Value),
    Invalidate,
    Remove,
}

/// Entry change distributed to the other hosts of a region
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryUpdate {
    pub region: String,
    pub key: String,
    pub operation: EntryOperation,
    pub version: EntryVersion,
}

/// A value together with the version it was written at
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub version: EntryVersion,
}

/// Outbound requests from one member to another
#[async_trait::async_trait]
pub trait PeerMessenger: Send + Sync {
    /// Ask `peer` for its local value of `key`; never triggers a load there
    async fn net_search(
        &self,
        peer: &MemberId,
        region: &str,
        key: &str,
    ) -> Result<Option<VersionedValue>>;

    /// Deliver an entry update to `peer`
    async fn replicate(&self, peer: &MemberId, update: EntryUpdate) -> Result<()>;

    /// Tell `peer` that `region` was destroyed cluster-wide
    async fn region_destroyed(&self, peer: &MemberId, region: &str) -> Result<()>;
}

/// Inbound side of [`PeerMessenger`], implemented by each member's cache
pub trait PeerEndpoint: Send + Sync {
    fn on_net_search(&self, region: &str, key: &str) -> Option<VersionedValue>;

    fn on_entry_update(&self, update: EntryUpdate);

    fn on_region_destroyed(&self, region: &str);
}

/// Messenger for members hosted in the same process
#[derive(Default)]
pub struct LocalPeerMessenger {
    endpoints: DashMap<MemberId, Weak<dyn PeerEndpoint>>,
    unreachable: DashSet<MemberId>,
}

impl LocalPeerMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, member: MemberId, endpoint: Weak<dyn PeerEndpoint>) {
        debug!(member = %member, "Registered peer endpoint");
        self.unreachable.remove(&member);
        self.endpoints.insert(member, endpoint);
    }

    pub fn deregister(&self, member: &MemberId) {
        self.endpoints.remove(member);
        self.unreachable.remove(member);
    }

    /// Simulate a network partition towards `member`
    pub fn set_reachable(&self, member: &MemberId, reachable: bool) {
        if reachable {
            self.unreachable.remove(member);
        } else {
            self.unreachable.insert(member.clone());
        }
    }

    fn endpoint(&self, peer: &MemberId) -> Result<Arc<dyn PeerEndpoint>> {
        if self.unreachable.contains(peer) {
            return Err(GridError::NetworkError(format!("member {} unreachable", peer)));
        }
        self.endpoints
            .get(peer)
            .and_then(|endpoint| endpoint.upgrade())
            .ok_or_else(|| GridError::NetworkError(format!("member {} not connected", peer)))
    }
}

#[async_trait::async_trait]
impl PeerMessenger for LocalPeerMessenger {
    async fn net_search(
        &self,
        peer: &MemberId,
        region: &str,
        key: &str,
    ) -> Result<Option<VersionedValue>> {
        let endpoint = self.endpoint(peer)?;
        // one hop
        tokio::task::yield_now().await;
        Ok(endpoint.on_net_search(region, key))
    }

    async fn replicate(&self, peer: &MemberId, update: EntryUpdate) -> Result<()> {
        let endpoint = self.endpoint(peer)?;
        tokio::task::yield_now().await;
        endpoint.on_entry_update(update);
        Ok(())
    }

    async fn region_destroyed(&self, peer: &MemberId, region: &str) -> Result<()> {
        let endpoint = self.endpoint(peer)?;
        tokio::task::yield_now().await;
        endpoint.on_region_destroyed(region);
        Ok(())
    }
}
