//! Broker error types.

use relay_core::{ConnectionId, TopicError};
use thiserror::Error;

/// Errors from broker session management and transports.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The transport could not be opened or refused a request.
    #[error("transport error: {0}")]
    Transport(String),
    /// A subscription pattern failed validation.
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(#[from] TopicError),
    /// No broker session exists for the id.
    #[error("unknown broker session: {0}")]
    UnknownSession(ConnectionId),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_display() {
        let err = BrokerError::UnknownSession(ConnectionId::from("c9"));
        assert_eq!(err.to_string(), "unknown broker session: c9");
    }

    #[test]
    fn topic_error_converts() {
        let err: BrokerError = TopicError::Empty.into();
        assert!(matches!(err, BrokerError::InvalidPattern(_)));
    }
}
