//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Viewer WebSocket connections opened total (counter).
pub const VIEWER_CONNECTIONS_TOTAL: &str = "relay_viewer_connections_total";
/// Viewer WebSocket disconnections total (counter).
pub const VIEWER_DISCONNECTIONS_TOTAL: &str = "relay_viewer_disconnections_total";
/// Active viewer WebSocket connections (gauge).
pub const VIEWER_CONNECTIONS_ACTIVE: &str = "relay_viewer_connections_active";
/// Viewer connection duration seconds (histogram).
pub const VIEWER_CONNECTION_DURATION_SECONDS: &str = "relay_viewer_connection_duration_seconds";
/// Viewers closed for missing heartbeats (counter).
pub const VIEWER_HEARTBEAT_TIMEOUTS_TOTAL: &str = "relay_viewer_heartbeat_timeouts_total";
/// Viewer requests total (counter, labels: type).
pub const VIEWER_REQUESTS_TOTAL: &str = "relay_viewer_requests_total";
/// Frames that could not be queued on a viewer channel (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "relay_broadcast_drops_total";
/// Broker sessions torn down because their last viewer left (counter).
pub const BROKER_RELEASES_TOTAL: &str = "relay_broker_releases_total";
