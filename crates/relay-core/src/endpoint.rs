//! Broker endpoint descriptors and subscriptions.
//!
//! These are the values a broker session is opened with. The persisted
//! forms live in the configuration store and convert into these.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::SubscriptionId;
use crate::qos::QualityLevel;

/// Wire transport used to reach a broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP.
    #[default]
    Mqtt,
    /// TLS over TCP.
    Mqtts,
}

impl Protocol {
    /// Conventional port for the protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Mqtt => 1883,
            Self::Mqtts => 8883,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mqtt => f.write_str("mqtt"),
            Self::Mqtts => f.write_str("mqtts"),
        }
    }
}

/// Everything needed to open a broker session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEndpoint {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Plain or TLS transport.
    #[serde(default)]
    pub protocol: Protocol,
    /// Optional user name.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keepalive_secs: u16,
    /// Whether the broker should discard prior session state.
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
}

fn default_clean_start() -> bool {
    true
}

impl BrokerEndpoint {
    /// `protocol://host:port`, used in logs.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

// Credentials stay out of logs.
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("clean_start", &self.clean_start)
            .finish()
    }
}

/// A topic subscription as held by a broker session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Stored subscription id.
    pub id: SubscriptionId,
    /// Topic pattern, possibly with wildcards.
    pub pattern: String,
    /// Requested delivery quality level.
    pub qos: QualityLevel,
    /// Inactive subscriptions are kept but not sent to the broker.
    pub active: bool,
}
