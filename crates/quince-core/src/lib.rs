//! Quince Core - regions, membership and read/write coordination
//!
//! This crate provides:
//! - Membership views and member change events
//! - Per-member timeout policy
//! - Net search and loader arbitration for read misses
//! - Regions with scope-checked creation, distribution and entry locks
//! - An in-process cluster hosting any number of members

pub mod cache;
pub mod cluster;
pub mod model;
pub mod region;
pub mod service;

pub use cache::{ClusterServices, GridCache};
pub use cluster::GridCluster;
pub use model::{CacheSettings, Configuration, EntryVersion, RegionAttributes};
pub use region::{EntryLock, Region};
pub use service::loader::{
    CacheLoader, FnLoader, LoaderArbitrator, LoaderHelper, MissAction, Resolution, ValueSource,
};
pub use service::member_event::{
    MemberChangeEvent, MemberChangeListener, MemberChangeType, MembershipView,
};
pub use service::net_search::{NetSearchCoordinator, NetSearchRequest, SearchOutcome};
pub use service::timeout::TimeoutPolicy;
