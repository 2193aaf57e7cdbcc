//! Viewer wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. [`ViewerEvent`] flows to
//! viewers, [`ViewerRequest`] flows from them. Field names are camelCase.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use relay_broker::ConnectionStatus;
use relay_core::{ConnectionId, InboundMessage, QualityLevel, ViewerId};
use relay_store::StoredMessage;
use serde::{Deserialize, Serialize};

/// Default `limit` for `getMessages`.
pub const DEFAULT_BATCH_LIMIT: usize = 50;

/// What a `status` event is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusScope {
    /// A broker session.
    Connection,
    /// The receiving viewer's own identity.
    Viewer,
}

/// How a payload string is encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Payload was valid UTF-8 and is sent verbatim.
    Utf8,
    /// Payload is standard base64.
    Base64,
}

/// Encode raw payload bytes for a JSON frame.
pub fn encode_payload(payload: &[u8]) -> (String, PayloadEncoding) {
    match std::str::from_utf8(payload) {
        Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
        Err(_) => (STANDARD.encode(payload), PayloadEncoding::Base64),
    }
}

/// Machine-readable code carried by an `error` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed frame or unknown request type.
    InvalidRequest,
    /// Referenced connection, topic or viewer does not exist.
    NotFound,
    /// A topic pattern failed validation.
    InvalidPattern,
    /// The broker link could not be opened.
    BrokerUnavailable,
    /// Anything else.
    InternalError,
}

/// One entry of a `messagesBatch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    /// Concrete topic.
    pub topic: String,
    /// Encoded payload.
    pub payload: String,
    /// Payload encoding.
    pub encoding: PayloadEncoding,
    /// Quality level.
    pub qos: QualityLevel,
    /// Retained flag.
    pub retained: bool,
    /// Receipt time.
    pub timestamp: DateTime<Utc>,
}

impl From<&StoredMessage> for BatchEntry {
    fn from(message: &StoredMessage) -> Self {
        let (payload, encoding) = encode_payload(&message.payload);
        Self {
            topic: message.topic.clone(),
            payload,
            encoding,
            qos: message.qos,
            retained: message.retained,
            timestamp: message.received_at,
        }
    }
}

/// Server → viewer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewerEvent {
    /// State change of a broker session or of the viewer identity.
    #[serde(rename_all = "camelCase")]
    Status {
        /// What `id` refers to.
        scope: StatusScope,
        /// Connection id or viewer token.
        id: String,
        /// New state.
        state: String,
        /// Channel attachment, for viewer-scoped status.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ws_client_id: Option<String>,
        /// Failure description.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A broker message.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Broker session it arrived on.
        connection_id: ConnectionId,
        /// Concrete topic.
        topic: String,
        /// Encoded payload.
        payload: String,
        /// Payload encoding.
        encoding: PayloadEncoding,
        /// Quality level.
        qos: QualityLevel,
        /// Retained flag.
        retained: bool,
        /// Receipt time.
        timestamp: DateTime<Utc>,
        /// Subscription patterns that matched.
        patterns: Vec<String>,
    },
    /// Reply to `getMessages`.
    #[serde(rename_all = "camelCase")]
    MessagesBatch {
        /// Connection the batch belongs to.
        connection_id: ConnectionId,
        /// Requested topic.
        topic: String,
        /// Newest first.
        messages: Vec<BatchEntry>,
    },
    /// Heartbeat ping; viewers answer with a `pong` request.
    Ping,
    /// Reply to a `ping` request.
    Pong,
    /// Synchronous rejection of a request.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// `type` of the rejected request, when it could be parsed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
    },
}

impl ViewerEvent {
    /// `status` for a broker session.
    pub fn connection_status(
        connection_id: &ConnectionId,
        status: ConnectionStatus,
        message: Option<String>,
    ) -> Self {
        Self::Status {
            scope: StatusScope::Connection,
            id: connection_id.to_string(),
            state: status.as_str().to_string(),
            ws_client_id: None,
            message,
        }
    }

    /// `status` telling a viewer which identity its channel is attached to.
    pub fn viewer_connected(viewer_id: &ViewerId, attachment: u64) -> Self {
        Self::Status {
            scope: StatusScope::Viewer,
            id: viewer_id.to_string(),
            state: "connected".to_string(),
            ws_client_id: Some(format!("ws-{attachment}")),
            message: None,
        }
    }

    /// `message` for an inbound broker message.
    pub fn from_message(message: &InboundMessage) -> Self {
        let (payload, encoding) = encode_payload(&message.payload);
        Self::Message {
            connection_id: message.connection_id.clone(),
            topic: message.topic.clone(),
            payload,
            encoding,
            qos: message.qos,
            retained: message.retained,
            timestamp: message.received_at,
            patterns: message.patterns.clone(),
        }
    }

    /// `error` event.
    pub fn error(code: ErrorCode, message: impl Into<String>, request_type: Option<&str>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            request_type: request_type.map(str::to_string),
        }
    }

    /// Serialize once for sharing across channels.
    pub fn encode(&self) -> Result<Arc<String>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::new)
    }
}

/// Viewer → server.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewerRequest {
    /// Bind this viewer to a broker session, opening it if needed.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Target connection.
        connection_id: ConnectionId,
    },
    /// Drop this viewer's binding to a broker session.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Target connection.
        connection_id: ConnectionId,
    },
    /// Ask for recent messages on a topic.
    #[serde(rename_all = "camelCase")]
    GetMessages {
        /// Target connection.
        connection_id: ConnectionId,
        /// Concrete topic.
        topic: String,
        /// Maximum number of entries.
        #[serde(default = "default_limit")]
        limit: usize,
    },
    /// Liveness check from the viewer.
    Ping,
    /// Acknowledgement of a server `ping`.
    Pong,
    /// Re-attach this channel to a previously issued identity.
    #[serde(rename_all = "camelCase")]
    Register {
        /// Identity from an earlier channel.
        #[serde(default)]
        prior_token: Option<ViewerId>,
    },
    /// Release every binding held by an identity.
    Cleanup {
        /// Identity to clean up.
        token: ViewerId,
    },
}

fn default_limit() -> usize {
    DEFAULT_BATCH_LIMIT
}

impl ViewerRequest {
    /// Wire name of the request.
    pub fn request_type(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::GetMessages { .. } => "getMessages",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Register { .. } => "register",
            Self::Cleanup { .. } => "cleanup",
        }
    }
}
