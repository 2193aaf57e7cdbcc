//! Store error types.

use relay_core::TopicError;
use thiserror::Error;

/// Errors from the configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the store file failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The store file is not valid JSON for the expected schema.
    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind (`connection`, `topic`).
        kind: &'static str,
        /// Requested id.
        id: String,
    },
    /// A topic record carries a pattern the broker would reject.
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(#[from] TopicError),
    /// A record field is out of range or missing.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    /// Shorthand for a missing connection.
    pub fn connection_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "connection",
            id: id.into(),
        }
    }

    /// Shorthand for a missing topic.
    pub fn topic_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "topic",
            id: id.into(),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = StoreError::connection_not_found("c1");
        assert_eq!(err.to_string(), "connection not found: c1");
    }

    #[test]
    fn pattern_error_converts() {
        let err: StoreError = TopicError::Empty.into();
        assert!(err.to_string().contains("topic pattern is empty"));
    }
}
