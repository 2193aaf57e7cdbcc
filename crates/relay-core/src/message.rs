//! Messages received from a broker session.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::ids::ConnectionId;
use crate::qos::QualityLevel;

/// A message received on a broker session, on its way to fan-out.
///
/// Exists only while the matcher and broadcaster process it; never stored.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Broker session the message arrived on.
    pub connection_id: ConnectionId,
    /// Concrete publish topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Delivery quality level of the publish.
    pub qos: QualityLevel,
    /// Whether the broker flagged this as a retained message.
    pub retained: bool,
    /// When the manager received it.
    pub received_at: DateTime<Utc>,
    /// Active subscription patterns on the session that matched `topic`.
    pub patterns: Vec<String>,
}

impl InboundMessage {
    /// Build a message stamped with the current time and no matched patterns.
    pub fn new(
        connection_id: ConnectionId,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QualityLevel,
        retained: bool,
    ) -> Self {
        Self {
            connection_id,
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
            received_at: Utc::now(),
            patterns: Vec::new(),
        }
    }

    /// Attach the matched subscription patterns.
    #[must_use]
    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }
}
