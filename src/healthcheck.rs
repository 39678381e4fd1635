use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::proxy::upstream::UpstreamClient;
use crate::state::ProxyState;

/// Periodically probes the upstream status endpoint, independent of inbound
/// traffic. One probe runs immediately, then one per `interval`, until the
/// shutdown channel flips.
pub async fn run_health_monitor(
    upstream: UpstreamClient,
    state: ProxyState,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match upstream.probe().await {
            Ok(status) => {
                state.record_probe_result(true);
                info!("upstream status check ok (HTTP {status})");
            }
            Err(err) => {
                state.record_probe_result(false);
                warn!("upstream status check failed: {err}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
}
