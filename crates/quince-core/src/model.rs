// Core data models and structures
// Configuration access, cache settings and region attributes

use quince_common::{
    DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_SEARCH_TIMEOUT_SECS, DataPolicy, MemberId, Scope,
};
use serde::{Deserialize, Serialize};

pub const MEMBER_NAME_PROPERTY: &str = "quince.member.name";
pub const LOCATORS_PROPERTY: &str = "quince.locators";
pub const BIND_ADDRESS_PROPERTY: &str = "quince.bind_address";
pub const LOCK_TIMEOUT_PROPERTY: &str = "quince.cache.lock_timeout";
pub const SEARCH_TIMEOUT_PROPERTY: &str = "quince.cache.search_timeout";
pub const LOCK_LEASE_PROPERTY: &str = "quince.lock.lease_ms";
pub const EXPIRY_SCAN_INTERVAL_PROPERTY: &str = "quince.lock.expiry_scan_interval_ms";
pub const EVENT_QUEUE_SIZE_PROPERTY: &str = "quince.member.event_queue_size";

const DEFAULT_EXPIRY_SCAN_INTERVAL_MS: u64 = 1000;
const DEFAULT_EVENT_QUEUE_SIZE: usize = 1024;

/// Application configuration wrapper
/// Provides typed access to configuration values with defaults
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    /// Name this process joins the cluster with
    pub fn member_name(&self) -> String {
        self.config
            .get_string(MEMBER_NAME_PROPERTY)
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("member-{}", std::process::id()))
    }

    /// Raw locators string, empty when running without locators
    pub fn locators(&self) -> String {
        self.config
            .get_string(LOCATORS_PROPERTY)
            .unwrap_or_default()
    }

    pub fn bind_address(&self) -> Option<String> {
        self.config
            .get_string(BIND_ADDRESS_PROPERTY)
            .ok()
            .filter(|addr| !addr.trim().is_empty())
    }

    pub fn lock_timeout_secs(&self) -> u64 {
        self.config
            .get_int(LOCK_TIMEOUT_PROPERTY)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS)
    }

    pub fn search_timeout_secs(&self) -> u64 {
        self.config
            .get_int(SEARCH_TIMEOUT_PROPERTY)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(DEFAULT_SEARCH_TIMEOUT_SECS)
    }

    /// Lock lease in milliseconds; 0 or unset disables leases
    pub fn lock_lease_ms(&self) -> Option<u64> {
        self.config
            .get_int(LOCK_LEASE_PROPERTY)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v > 0)
    }

    pub fn expiry_scan_interval_ms(&self) -> u64 {
        self.config
            .get_int(EXPIRY_SCAN_INTERVAL_PROPERTY)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_EXPIRY_SCAN_INTERVAL_MS)
    }

    pub fn event_queue_size(&self) -> usize {
        self.config
            .get_int(EVENT_QUEUE_SIZE_PROPERTY)
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_EVENT_QUEUE_SIZE)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            lock_timeout_secs: self.lock_timeout_secs(),
            search_timeout_secs: self.search_timeout_secs(),
            lock_lease_ms: self.lock_lease_ms(),
            expiry_scan_interval_ms: self.expiry_scan_interval_ms(),
            event_queue_size: self.event_queue_size(),
        }
    }
}

/// Settings shared by every member of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    pub lock_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub lock_lease_ms: Option<u64>,
    pub expiry_scan_interval_ms: u64,
    pub event_queue_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            search_timeout_secs: DEFAULT_SEARCH_TIMEOUT_SECS,
            lock_lease_ms: None,
            expiry_scan_interval_ms: DEFAULT_EXPIRY_SCAN_INTERVAL_MS,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }
}

/// Attributes a region is created with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionAttributes {
    pub scope: Scope,
    pub data_policy: DataPolicy,
    /// Reject distributed updates older than the local entry
    pub concurrency_checks_enabled: bool,
}

impl Default for RegionAttributes {
    fn default() -> Self {
        Self {
            scope: Scope::default(),
            data_policy: DataPolicy::default(),
            concurrency_checks_enabled: true,
        }
    }
}

impl RegionAttributes {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_data_policy(mut self, data_policy: DataPolicy) -> Self {
        self.data_policy = data_policy;
        self
    }

    pub fn with_concurrency_checks(mut self, enabled: bool) -> Self {
        self.concurrency_checks_enabled = enabled;
        self
    }
}

/// Version stamped on every entry write.
///
/// Ordered by counter, then by originating member so that concurrent writes
/// from two members resolve the same way everywhere.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryVersion {
    pub counter: u64,
    pub origin: MemberId,
}

impl EntryVersion {
    /// Next version after `previous`, never behind the wall clock
    pub fn next(previous: Option<&EntryVersion>, origin: &MemberId) -> Self {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let counter = previous.map_or(now, |prev| (prev.counter + 1).max(now));
        Self {
            counter,
            origin: origin.clone(),
        }
    }
}
