//! Scope registry data model

use std::collections::BTreeSet;

use quince_common::{MemberId, Scope};
use serde::{Deserialize, Serialize};

/// Published agreement on the scope of one distributed region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRecord {
    /// Full region path
    pub region: String,
    pub scope: Scope,
    /// Member whose creation established the record
    pub established_by: MemberId,
    /// Members currently hosting the region
    pub hosts: BTreeSet<MemberId>,
    /// Establishing timestamp (Unix millis)
    pub established_at: i64,
}

impl ScopeRecord {
    pub fn new(region: impl Into<String>, scope: Scope, member: MemberId) -> Self {
        let mut hosts = BTreeSet::new();
        hosts.insert(member.clone());
        Self {
            region: region.into(),
            scope,
            established_by: member,
            hosts,
            established_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_hosted_by(&self, member: &MemberId) -> bool {
        self.hosts.contains(member)
    }

    /// Whether `other` should replace this record when the two disagree
    pub(crate) fn yields_to(&self, other: &ScopeRecord) -> bool {
        other.established_by < self.established_by
    }
}

/// Result of a successful [`register`](super::ScopeRegistry::register)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// No record existed; the caller's scope is now authoritative
    Established,
    /// A compatible record existed and the caller was added as a host
    Joined,
    /// LOCAL regions are private and never published
    Private,
}

/// Result of merging a record learned from another partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No local record existed; the incoming one was stored
    Adopted,
    /// Same scope on both sides; host sets were merged
    Merged,
    /// Scopes disagreed and the incoming record won the tie-break
    Replaced { previous: ScopeRecord },
    /// Scopes disagreed and the local record won the tie-break
    Retained { rejected: ScopeRecord },
}
