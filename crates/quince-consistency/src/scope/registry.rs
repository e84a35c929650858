//! Cluster-wide region scope registry

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use quince_common::{GridError, MemberId, Result, Scope};
use tracing::{debug, info, warn};

use super::model::{ReconcileOutcome, RegistrationOutcome, ScopeRecord};

/// Registry of published scope records, one per distributed region path.
///
/// Registration for one path is serialized by the map's entry lock, so of two
/// racing creators with conflicting scopes exactly one establishes the record.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    records: DashMap<String, ScopeRecord>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `member` as a host of `region` with `scope`.
    ///
    /// Fails with [`GridError::ScopeConflict`] when the region was established
    /// with a different scope. The existing record is left untouched.
    pub fn register(
        &self,
        region: &str,
        scope: Scope,
        member: &MemberId,
    ) -> Result<RegistrationOutcome> {
        if scope.is_local() {
            return Ok(RegistrationOutcome::Private);
        }

        match self.records.entry(region.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(ScopeRecord::new(region, scope, member.clone()));
                info!(region = %region, scope = %scope, member = %member, "Region scope established");
                Ok(RegistrationOutcome::Established)
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.scope != scope {
                    warn!(
                        region = %region,
                        existing = %record.scope,
                        requested = %scope,
                        member = %member,
                        "Rejected region with incompatible scope"
                    );
                    return Err(GridError::ScopeConflict {
                        region: region.to_string(),
                        existing: record.scope,
                        requested: scope,
                        established_by: record.established_by.clone(),
                    });
                }
                record.hosts.insert(member.clone());
                debug!(region = %region, member = %member, "Joined region");
                Ok(RegistrationOutcome::Joined)
            }
        }
    }

    /// Remove `member` from the hosts of `region`.
    ///
    /// Returns true when this removed the last host and with it the record.
    pub fn unregister(&self, region: &str, member: &MemberId) -> bool {
        if let Some(mut record) = self.records.get_mut(region) {
            record.hosts.remove(member);
        }
        let removed = self
            .records
            .remove_if(region, |_, record| record.hosts.is_empty())
            .is_some();
        if removed {
            debug!(region = %region, "Last host left, scope record removed");
        }
        removed
    }

    /// Drop the record of a region destroyed cluster-wide
    pub fn remove(&self, region: &str) -> Option<ScopeRecord> {
        self.records.remove(region).map(|(_, record)| record)
    }

    pub fn lookup(&self, region: &str) -> Option<ScopeRecord> {
        self.records.get(region).map(|record| record.clone())
    }

    /// Members hosting `region`, in member order
    pub fn hosts(&self, region: &str) -> Vec<MemberId> {
        self.records
            .get(region)
            .map(|record| record.hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Prune a departed member from every record. Returns the number of
    /// records that were removed because it was their last host.
    pub fn member_departed(&self, member: &MemberId) -> usize {
        for mut record in self.records.iter_mut() {
            record.hosts.remove(member);
        }

        let before = self.records.len();
        self.records.retain(|_, record| !record.hosts.is_empty());
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!(member = %member, count = removed, "Removed scope records of departed member");
        }
        removed
    }

    /// Merge a record learned from another partition.
    ///
    /// When both sides agree on the scope the host sets are merged and the
    /// lower establishing member is kept. When they disagree the record
    /// established by the lowest member id wins.
    pub fn reconcile(&self, incoming: ScopeRecord) -> ReconcileOutcome {
        match self.records.entry(incoming.region.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(incoming);
                ReconcileOutcome::Adopted
            }
            Entry::Occupied(mut entry) => {
                let local = entry.get_mut();
                if local.scope == incoming.scope {
                    if local.yields_to(&incoming) {
                        local.established_by = incoming.established_by.clone();
                        local.established_at = incoming.established_at;
                    }
                    local.hosts.extend(incoming.hosts);
                    return ReconcileOutcome::Merged;
                }

                if local.yields_to(&incoming) {
                    warn!(
                        region = %incoming.region,
                        kept = %incoming.scope,
                        dropped = %local.scope,
                        "Scope conflict after merge, adopting record of lower member"
                    );
                    let previous = std::mem::replace(local, incoming);
                    ReconcileOutcome::Replaced { previous }
                } else {
                    warn!(
                        region = %incoming.region,
                        kept = %local.scope,
                        dropped = %incoming.scope,
                        "Scope conflict after merge, keeping local record"
                    );
                    ReconcileOutcome::Retained { rejected: incoming }
                }
            }
        }
    }

    /// Snapshot of every published record
    pub fn records(&self) -> Vec<ScopeRecord> {
        let mut records: Vec<ScopeRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.region.cmp(&b.region));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn m(id: &str) -> MemberId {
        MemberId::new(id)
    }

    #[test]
    fn test_register_establish_and_join() {
        let registry = ScopeRegistry::new();
        assert_eq!(
            registry.register("/ROOT/r", Scope::Global, &m("m1")).unwrap(),
            RegistrationOutcome::Established
        );
        assert_eq!(
            registry.register("/ROOT/r", Scope::Global, &m("m2")).unwrap(),
            RegistrationOutcome::Joined
        );
        assert_eq!(registry.hosts("/ROOT/r"), vec![m("m1"), m("m2")]);
    }

    #[test]
    fn test_conflicting_scope_is_rejected() {
        let registry = ScopeRegistry::new();
        registry.register("/ROOT/r", Scope::Global, &m("m1")).unwrap();

        let err = registry
            .register("/ROOT/r", Scope::DistributedNoAck, &m("m2"))
            .unwrap_err();
        match err {
            GridError::ScopeConflict {
                existing,
                requested,
                established_by,
                ..
            } => {
                assert_eq!(existing, Scope::Global);
                assert_eq!(requested, Scope::DistributedNoAck);
                assert_eq!(established_by, m("m1"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // The record is not overwritten and the rejected member is not a host
        let record = registry.lookup("/ROOT/r").unwrap();
        assert_eq!(record.scope, Scope::Global);
        assert!(!record.is_hosted_by(&m("m2")));
    }

    #[test]
    fn test_local_regions_are_not_published() {
        let registry = ScopeRegistry::new();
        assert_eq!(
            registry.register("/ROOT/r", Scope::Local, &m("m1")).unwrap(),
            RegistrationOutcome::Private
        );
        assert!(registry.lookup("/ROOT/r").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_last_host_removes_record() {
        let registry = ScopeRegistry::new();
        registry.register("/ROOT/r", Scope::DistributedAck, &m("m1")).unwrap();
        registry.register("/ROOT/r", Scope::DistributedAck, &m("m2")).unwrap();

        assert!(!registry.unregister("/ROOT/r", &m("m1")));
        assert!(registry.unregister("/ROOT/r", &m("m2")));
        assert!(registry.lookup("/ROOT/r").is_none());

        // A different scope may be established once the region is gone
        assert_eq!(
            registry.register("/ROOT/r", Scope::Global, &m("m3")).unwrap(),
            RegistrationOutcome::Established
        );
    }

    #[test]
    fn test_member_departed_prunes_records() {
        let registry = ScopeRegistry::new();
        registry.register("/ROOT/a", Scope::Global, &m("m1")).unwrap();
        registry.register("/ROOT/b", Scope::Global, &m("m1")).unwrap();
        registry.register("/ROOT/b", Scope::Global, &m("m2")).unwrap();

        assert_eq!(registry.member_departed(&m("m1")), 1);
        assert!(registry.lookup("/ROOT/a").is_none());
        assert_eq!(registry.hosts("/ROOT/b"), vec![m("m2")]);
    }

    #[test]
    fn test_reconcile_tie_break() {
        let registry = ScopeRegistry::new();
        registry.register("/ROOT/r", Scope::DistributedNoAck, &m("m5")).unwrap();

        let incoming = ScopeRecord::new("/ROOT/r", Scope::Global, m("m2"));
        let outcome = registry.reconcile(incoming);
        assert!(matches!(outcome, ReconcileOutcome::Replaced { ref previous } if previous.scope == Scope::DistributedNoAck));
        assert_eq!(registry.lookup("/ROOT/r").unwrap().scope, Scope::Global);

        let loser = ScopeRecord::new("/ROOT/r", Scope::DistributedAck, m("m9"));
        assert!(matches!(
            registry.reconcile(loser),
            ReconcileOutcome::Retained { .. }
        ));
        assert_eq!(registry.lookup("/ROOT/r").unwrap().established_by, m("m2"));
    }

    #[test]
    fn test_reconcile_merges_hosts() {
        let registry = ScopeRegistry::new();
        registry.register("/ROOT/r", Scope::Global, &m("m3")).unwrap();

        let mut incoming = ScopeRecord::new("/ROOT/r", Scope::Global, m("m1"));
        incoming.hosts.insert(m("m4"));
        assert_eq!(registry.reconcile(incoming), ReconcileOutcome::Merged);

        let record = registry.lookup("/ROOT/r").unwrap();
        assert_eq!(record.established_by, m("m1"));
        assert_eq!(record.hosts.len(), 3);

        let fresh = ScopeRecord::new("/ROOT/other", Scope::Global, m("m7"));
        assert_eq!(registry.reconcile(fresh), ReconcileOutcome::Adopted);
        assert_eq!(registry.records().len(), 2);
    }

    #[test]
    fn test_racing_conflicting_creators_one_wins() {
        let registry = Arc::new(ScopeRegistry::new());
        let scopes = [Scope::Global, Scope::DistributedNoAck];

        let handles: Vec<_> = scopes
            .into_iter()
            .enumerate()
            .map(|(i, scope)| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.register("/ROOT/race", scope, &MemberId::new(format!("m{i}")))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert_eq!(registry.hosts("/ROOT/race").len(), 1);
    }
}
