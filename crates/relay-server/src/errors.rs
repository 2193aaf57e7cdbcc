//! Relay server error types and their HTTP / viewer-protocol mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_broker::BrokerError;
use relay_store::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::protocol::ErrorCode;

/// Errors surfaced by the coordinator, the REST API and the WebSocket layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Broker session manager failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// A referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Requested id.
        id: String,
    },
    /// Malformed or out-of-range request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Listener or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Shorthand for an unregistered viewer.
    pub fn viewer_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "viewer",
            id: id.into(),
        }
    }

    /// Code reported to viewers in an `error` event.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(StoreError::NotFound { .. })
            | Self::Broker(BrokerError::UnknownSession(_))
            | Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Store(StoreError::InvalidPattern(_)) | Self::Broker(BrokerError::InvalidPattern(_)) => {
                ErrorCode::InvalidPattern
            }
            Self::Store(StoreError::InvalidRecord(_)) | Self::InvalidRequest(_) => {
                ErrorCode::InvalidRequest
            }
            Self::Broker(BrokerError::Transport(_)) => ErrorCode::BrokerUnavailable,
            Self::Store(StoreError::Io(_) | StoreError::Json(_)) | Self::Io(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// HTTP status for the REST API.
    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidPattern | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::BrokerUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Result type for relay server operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{ConnectionId, TopicError};

    #[test]
    fn not_found_variants_map_to_404() {
        let errs = [
            RelayError::from(StoreError::connection_not_found("c1")),
            RelayError::from(BrokerError::UnknownSession(ConnectionId::from("c1"))),
            RelayError::viewer_not_found("v1"),
        ];
        for err in errs {
            assert_eq!(err.code(), ErrorCode::NotFound);
            assert_eq!(err.status(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn pattern_errors_are_bad_request() {
        let err = RelayError::from(StoreError::InvalidPattern(TopicError::Empty));
        assert_eq!(err.code(), ErrorCode::InvalidPattern);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn transport_error_is_bad_gateway() {
        let err = RelayError::from(BrokerError::Transport("refused".into()));
        assert_eq!(err.code(), ErrorCode::BrokerUnavailable);
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn store_message_passes_through() {
        let err = RelayError::from(StoreError::topic_not_found("t1"));
        assert_eq!(err.to_string(), "topic not found: t1");
    }

    #[tokio::test]
    async fn response_body_has_code_and_message() {
        let resp = RelayError::InvalidRequest("port must be non-zero".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"]["code"], "INVALID_REQUEST");
        assert_eq!(
            parsed["error"]["message"],
            "invalid request: port must be non-zero"
        );
    }
}
