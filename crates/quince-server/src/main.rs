//! Main entry point for a Quince cluster member.
//!
//! Loads configuration, validates the locators, starts the cluster services
//! and joins them under the configured member name until shutdown.

use anyhow::Context;
use quince_common::parse_locators;
use quince_core::GridCluster;
use quince_server::startup::{self, LoggingConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = quince_server::config::load()?;

    let logging_config = LoggingConfig::from_configuration(&configuration);
    let _logging_guard = startup::init_logging(&logging_config)?;

    quince_server::metrics::init_metrics();

    let bind_address = configuration.bind_address();
    let locators = match parse_locators(&configuration.locators(), bind_address.as_deref()) {
        Ok(locators) => locators,
        Err(e) => {
            error!(error = %e, code = e.code().code, "Invalid locators configuration");
            return Err(e.into());
        }
    };
    for locator in &locators {
        info!(locator = %locator, resolved = locator.is_resolved(), "Using locator");
    }

    let settings = configuration.cache_settings();
    info!(
        lock_timeout_secs = settings.lock_timeout_secs,
        search_timeout_secs = settings.search_timeout_secs,
        lock_lease_ms = ?settings.lock_lease_ms,
        "Starting cluster services"
    );
    let cluster = GridCluster::start(settings).await;
    let _membership_metrics = quince_server::metrics::track_membership(cluster.subscribe());

    let member = configuration.member_name();
    let cache = cluster
        .join(member.as_str())
        .await
        .with_context(|| format!("failed to join as {}", member))?;
    info!(
        member = %cache.member_id(),
        address = %quince_common::local_ip(),
        view = cache.view().view_id,
        "Member joined"
    );

    let shutdown = startup::wait_for_shutdown_signal();
    let mut shutdown_rx = shutdown.subscribe();
    let _ = shutdown_rx.recv().await;

    cluster.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
