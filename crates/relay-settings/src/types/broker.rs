//! Broker client settings.

use relay_core::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// Settings applied to every broker session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Reconnect schedule handed to each transport.
    pub reconnect: ReconnectPolicy,
    /// Request queue depth of the underlying MQTT client.
    pub event_capacity: usize,
    /// Keep-alive used when a connection record does not set one, in seconds.
    pub default_keepalive_secs: u16,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            event_capacity: 64,
            default_keepalive_secs: 60,
        }
    }
}
