// Metrics module for observability
// Describes the metrics recorded by the lock service, net search and loaders,
// and tracks the installed membership view

use metrics::{describe_counter, describe_gauge, gauge};
use quince_core::MemberChangeEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Lock metrics
    describe_gauge!("quince_locks_held", "Number of granted distributed locks");

    // Read path metrics
    describe_counter!(
        "quince_net_search_total",
        "Total number of net searches, by outcome"
    );
    describe_counter!(
        "quince_loader_invocations_total",
        "Total number of cache loader invocations"
    );

    // Cluster metrics
    describe_gauge!("quince_cluster_members", "Members in the installed view");
    describe_gauge!("quince_view_id", "Id of the installed membership view");

    tracing::info!("Metrics initialized");
}

/// Update cluster membership gauges
pub fn set_cluster_view(view_id: u64, members: usize) {
    gauge!("quince_cluster_members").set(members as f64);
    gauge!("quince_view_id").set(view_id as f64);
}

/// Follow membership events and keep the cluster gauges current
pub fn track_membership(mut events: broadcast::Receiver<MemberChangeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    set_cluster_view(event.view.view_id, event.view.len());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Membership metrics lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
