// Net search
// Satisfies a local miss from the other hosts of a region before any loader runs

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use quince_common::MemberId;
use quince_consistency::ScopeRegistry;
use serde_json::Value;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use super::member_event::MembershipView;
use super::messenger::PeerMessenger;
use crate::model::EntryVersion;

/// A single lookup of `key` in `region` on behalf of `requester`
#[derive(Clone, Debug)]
pub struct NetSearchRequest {
    pub region: String,
    pub key: String,
    pub requester: MemberId,
    pub deadline: Instant,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SearchOutcome {
    Found {
        value: Value,
        version: EntryVersion,
        from: MemberId,
    },
    NotFound,
}

impl SearchOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, SearchOutcome::Found { .. })
    }
}

/// Queries the published hosts of a region in parallel; first hit wins
pub struct NetSearchCoordinator {
    messenger: Arc<dyn PeerMessenger>,
    registry: Arc<ScopeRegistry>,
}

impl NetSearchCoordinator {
    pub fn new(messenger: Arc<dyn PeerMessenger>, registry: Arc<ScopeRegistry>) -> Self {
        Self {
            messenger,
            registry,
        }
    }

    /// Hosts of the region that are in `view`, excluding the requester
    pub fn candidates(&self, request: &NetSearchRequest, view: &MembershipView) -> Vec<MemberId> {
        self.registry
            .hosts(&request.region)
            .into_iter()
            .filter(|host| host != &request.requester && view.contains(host))
            .collect()
    }

    /// Search peers until one has the value or the deadline passes.
    ///
    /// Peer failures count as a miss from that peer. Outstanding queries are
    /// dropped as soon as a value is found.
    pub async fn search(&self, request: &NetSearchRequest, view: &MembershipView) -> SearchOutcome {
        let candidates = self.candidates(request, view);
        if candidates.is_empty() {
            return SearchOutcome::NotFound;
        }

        let messenger = &self.messenger;
        let region = request.region.as_str();
        let key = request.key.as_str();
        let mut pending: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|peer| async move {
                let result = messenger.net_search(&peer, region, key).await;
                (peer, result)
            })
            .collect();

        loop {
            match timeout_at(request.deadline, pending.next()).await {
                Ok(Some((peer, Ok(Some(found))))) => {
                    debug!(region = %region, key = %key, from = %peer, "Net search hit");
                    metrics::counter!("quince_net_search_total", "outcome" => "found")
                        .increment(1);
                    return SearchOutcome::Found {
                        value: found.value,
                        version: found.version,
                        from: peer,
                    };
                }
                Ok(Some((_, Ok(None)))) => {}
                Ok(Some((peer, Err(e)))) => {
                    warn!(region = %region, key = %key, peer = %peer, error = %e, "Net search peer failed");
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(region = %region, key = %key, "Net search deadline elapsed");
                    break;
                }
            }
        }

        metrics::counter!("quince_net_search_total", "outcome" => "not_found").increment(1);
        SearchOutcome::NotFound
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quince_common::{GridError, Result, Scope};
    use serde_json::json;

    use super::*;
    use crate::service::messenger::{EntryUpdate, VersionedValue};

    fn m(id: &str) -> MemberId {
        MemberId::new(id)
    }

    /// Peers answer from a fixed table; `slow` peers never answer
    struct ScriptedMessenger {
        holders: Vec<MemberId>,
        failing: Vec<MemberId>,
        slow: Vec<MemberId>,
    }

    #[async_trait::async_trait]
    impl PeerMessenger for ScriptedMessenger {
        async fn net_search(
            &self,
            peer: &MemberId,
            _region: &str,
            _key: &str,
        ) -> Result<Option<VersionedValue>> {
            if self.slow.contains(peer) {
                std::future::pending::<()>().await;
            }
            if self.failing.contains(peer) {
                return Err(GridError::NetworkError("down".to_string()));
            }
            Ok(self.holders.contains(peer).then(|| VersionedValue {
                value: json!(format!("from-{}", peer)),
                version: EntryVersion {
                    counter: 1,
                    origin: peer.clone(),
                },
            }))
        }

        async fn replicate(&self, _peer: &MemberId, _update: EntryUpdate) -> Result<()> {
            Ok(())
        }

        async fn region_destroyed(&self, _peer: &MemberId, _region: &str) -> Result<()> {
            Ok(())
        }
    }

    fn setup(messenger: ScriptedMessenger, hosts: &[&str]) -> NetSearchCoordinator {
        let registry = Arc::new(ScopeRegistry::new());
        for host in hosts {
            registry
                .register("/ROOT/r", Scope::Global, &m(host))
                .unwrap();
        }
        NetSearchCoordinator::new(Arc::new(messenger), registry)
    }

    fn view(members: &[&str]) -> MembershipView {
        MembershipView {
            view_id: 1,
            members: members.iter().map(|id| m(id)).collect(),
        }
    }

    fn request(deadline_ms: u64) -> NetSearchRequest {
        NetSearchRequest {
            region: "/ROOT/r".to_string(),
            key: "KEY".to_string(),
            requester: m("a"),
            deadline: Instant::now() + Duration::from_millis(deadline_ms),
        }
    }

    #[tokio::test]
    async fn test_found_on_peer() {
        let coordinator = setup(
            ScriptedMessenger {
                holders: vec![m("c")],
                failing: vec![m("b")],
                slow: vec![],
            },
            &["a", "b", "c"],
        );

        let outcome = coordinator
            .search(&request(1000), &view(&["a", "b", "c"]))
            .await;
        assert_eq!(
            outcome,
            SearchOutcome::Found {
                value: json!("from-c"),
                version: EntryVersion {
                    counter: 1,
                    origin: m("c")
                },
                from: m("c"),
            }
        );
    }

    #[tokio::test]
    async fn test_excludes_requester_and_departed_hosts() {
        let coordinator = setup(
            ScriptedMessenger {
                holders: vec![m("a"), m("c")],
                failing: vec![],
                slow: vec![],
            },
            &["a", "b", "c"],
        );

        // c hosts the region but is no longer in the view
        let req = request(1000);
        let current = view(&["a", "b"]);
        assert_eq!(coordinator.candidates(&req, &current), vec![m("b")]);
        assert_eq!(
            coordinator.search(&req, &current).await,
            SearchOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_errors_are_not_found() {
        let coordinator = setup(
            ScriptedMessenger {
                holders: vec![],
                failing: vec![m("b")],
                slow: vec![],
            },
            &["a", "b"],
        );
        assert!(
            !coordinator
                .search(&request(1000), &view(&["a", "b"]))
                .await
                .is_found()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_not_found() {
        let coordinator = setup(
            ScriptedMessenger {
                holders: vec![],
                failing: vec![],
                slow: vec![m("b")],
            },
            &["a", "b"],
        );

        let started = Instant::now();
        let outcome = coordinator
            .search(&request(500), &view(&["a", "b"]))
            .await;
        assert_eq!(outcome, SearchOutcome::NotFound);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_hit_beats_slow_peer() {
        let coordinator = setup(
            ScriptedMessenger {
                holders: vec![m("c")],
                failing: vec![],
                slow: vec![m("b")],
            },
            &["a", "b", "c"],
        );

        let outcome = coordinator
            .search(&request(60_000), &view(&["a", "b", "c"]))
            .await;
        assert!(matches!(outcome, SearchOutcome::Found { from, .. } if from == m("c")));
    }
}
