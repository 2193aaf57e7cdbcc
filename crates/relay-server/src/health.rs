//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered viewer identities.
    pub viewers: usize,
    /// Broker sessions with an open link.
    pub broker_sessions: usize,
    /// Broker sessions currently accepted by their broker.
    pub connected_brokers: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    viewers: usize,
    broker_sessions: usize,
    connected_brokers: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        viewers,
        broker_sessions,
        connected_brokers,
    }
}
