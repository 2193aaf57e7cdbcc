//! Server, store, and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket listener and viewer-liveness settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listener port.
    pub port: u16,
    /// Interval between viewer heartbeat pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consecutive unacknowledged pings before a viewer is closed.
    pub max_missed_heartbeats: u32,
    /// How long shutdown waits for broker sessions to close, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Maximum inbound WebSocket frame size in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per viewer channel.
    pub channel_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            heartbeat_interval_ms: 30_000,
            max_missed_heartbeats: 2,
            shutdown_grace_ms: 5_000,
            max_message_size: 1_048_576,
            channel_capacity: 256,
        }
    }
}

/// Configuration store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Store file, relative to `~/.relay` unless absolute.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "connections.json".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per line instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.port, 8080);
        assert_eq!(s.heartbeat_interval_ms, 30_000);
        assert_eq!(s.max_missed_heartbeats, 2);
        assert_eq!(s.shutdown_grace_ms, 5_000);
    }

    #[test]
    fn server_partial_json() {
        let s: ServerSettings = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(s.port, 9000);
        assert_eq!(s.host, "0.0.0.0");
    }

    #[test]
    fn logging_defaults() {
        let l = LoggingSettings::default();
        assert_eq!(l.level, "info");
        assert!(!l.json);
    }
}
