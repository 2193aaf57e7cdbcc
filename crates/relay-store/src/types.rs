//! Persisted record types.

use chrono::{DateTime, Utc};
use relay_core::{
    BrokerEndpoint, ConnectionId, Protocol, QualityLevel, Subscription, SubscriptionId,
};
use serde::{Deserialize, Serialize};

/// Current on-disk schema version.
pub const STORE_VERSION: u32 = 1;

/// A configured broker connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Connection id, also the broker session id.
    pub id: ConnectionId,
    /// Display name.
    pub name: String,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Plain or TLS.
    #[serde(default)]
    pub protocol: Protocol,
    /// Optional user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client identifier; generated from the connection id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Whether the broker should discard prior session state.
    #[serde(default = "default_true")]
    pub clean_start: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

fn default_keepalive() -> u16 {
    60
}

fn default_true() -> bool {
    true
}

impl ConnectionRecord {
    /// New record with a fresh id and default options.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            name: name.into(),
            host: host.into(),
            port,
            protocol: Protocol::Mqtt,
            username: None,
            password: None,
            client_id: None,
            keepalive_secs: default_keepalive(),
            clean_start: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Client identifier presented to the broker.
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("relay-{}", self.id))
    }

    /// Descriptor a broker session is opened with.
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self.effective_client_id(),
            keepalive_secs: self.keepalive_secs,
            clean_start: self.clean_start,
        }
    }

    /// Copy with the password removed, for API responses.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            password: None,
            ..self.clone()
        }
    }
}

/// A stored topic subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRecord {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Topic pattern.
    pub pattern: String,
    /// Requested quality level.
    #[serde(default)]
    pub qos: QualityLevel,
    /// Whether the subscription is sent to the broker.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TopicRecord {
    /// New active record with a fresh id.
    pub fn new(connection_id: ConnectionId, pattern: impl Into<String>, qos: QualityLevel) -> Self {
        Self {
            id: SubscriptionId::new(),
            connection_id,
            pattern: pattern.into(),
            qos,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// The form a broker session holds.
    pub fn subscription(&self) -> Subscription {
        Subscription {
            id: self.id.clone(),
            pattern: self.pattern.clone(),
            qos: self.qos,
            active: self.active,
        }
    }
}

/// A previously received message, as returned by history queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Concrete topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Quality level of the publish.
    pub qos: QualityLevel,
    /// Retained flag.
    pub retained: bool,
    /// Receipt time.
    pub received_at: DateTime<Utc>,
}

/// Whole-file representation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreData {
    /// Schema version.
    pub version: u32,
    /// Connection records.
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
    /// Topic records.
    #[serde(default)]
    pub topics: Vec<TopicRecord>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            connections: Vec::new(),
            topics: Vec::new(),
        }
    }
}
