//! Transport boundary between the session manager and a broker client.
//!
//! A transport opens one broker link per session and reports what happens on
//! it as an ordered stream of [`TransportEvent`]s. The returned
//! [`TransportHandle`] issues requests without blocking; their outcomes show
//! up on the event stream.

use bytes::Bytes;
use relay_core::{BrokerEndpoint, ConnectionId, QualityLevel, ReconnectPolicy};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::errors::Result;

/// Something that happened on a broker link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the connection (initial or after reconnect).
    Connected,
    /// The link failed. The transport keeps retrying per its policy.
    Error {
        /// Broker return/reason code, when the broker supplied one.
        code: Option<u8>,
        /// Human-readable description.
        message: String,
    },
    /// The link is gone for good. No further events follow.
    Closed,
    /// A publish arrived.
    Message {
        /// Concrete topic.
        topic: String,
        /// Raw payload.
        payload: Bytes,
        /// Delivery quality level.
        qos: QualityLevel,
        /// Retained flag.
        retained: bool,
    },
}

/// Category of a link failure, derived from the broker's code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// User name or password rejected.
    BadCredentials,
    /// Client identifier rejected.
    BadIdentifier,
    /// Client not authorized.
    RejectedClient,
    /// Anything else.
    Generic,
}

impl ErrorKind {
    /// Classify an MQTT 3.1.1 return code or MQTT 5 reason code.
    pub fn from_code(code: Option<u8>) -> Self {
        match code {
            Some(4 | 134) => Self::BadCredentials,
            Some(2 | 133) => Self::BadIdentifier,
            Some(5 | 135) => Self::RejectedClient,
            _ => Self::Generic,
        }
    }

    /// Status text shown to viewers; `fallback` is used for [`Self::Generic`].
    pub fn describe(self, fallback: &str) -> String {
        match self {
            Self::BadCredentials => "bad username or password".to_string(),
            Self::BadIdentifier => "client identifier rejected".to_string(),
            Self::RejectedClient => "client not authorized".to_string(),
            Self::Generic => fallback.to_string(),
        }
    }
}

/// Request side of an open broker link.
pub trait TransportHandle: Send + Sync {
    /// Queue a subscribe request.
    fn subscribe(&self, pattern: &str, qos: QualityLevel) -> Result<()>;
    /// Queue an unsubscribe request.
    fn unsubscribe(&self, pattern: &str) -> Result<()>;
    /// Ask the link to shut down. A [`TransportEvent::Closed`] follows.
    fn disconnect(&self);
}

/// An opened link: request handle plus ordered event stream.
pub struct TransportSession {
    /// Request handle, owned by the session manager.
    pub handle: Box<dyn TransportHandle>,
    /// Events in the order they happened on the link.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for broker links.
pub trait Transport: Send + Sync {
    /// Open a link to `endpoint`, retrying per `policy`.
    ///
    /// Must be called from within a Tokio runtime.
    fn open(
        &self,
        connection_id: &ConnectionId,
        endpoint: &BrokerEndpoint,
        policy: &ReconnectPolicy,
    ) -> Result<TransportSession>;
}
