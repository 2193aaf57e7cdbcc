//! Server configuration.

use std::time::Duration;

use relay_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`crate::RelayServer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Interval between viewer heartbeat pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consecutive unacknowledged pings before a viewer is closed.
    pub max_missed_heartbeats: u32,
    /// How long shutdown waits for broker sessions to close, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per viewer channel.
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval_ms: 30_000,
            max_missed_heartbeats: 2,
            shutdown_grace_ms: 5_000,
            max_message_size: 1024 * 1024,
            channel_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Build from the `server` section of the loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            heartbeat_interval_ms: settings.heartbeat_interval_ms,
            max_missed_heartbeats: settings.max_missed_heartbeats,
            shutdown_grace_ms: settings.shutdown_grace_ms,
            max_message_size: settings.max_message_size,
            channel_capacity: settings.channel_capacity,
        }
    }

    /// Heartbeat period as a [`Duration`], never zero.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
