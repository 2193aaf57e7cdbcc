//! Topic pattern matching.
//!
//! Patterns are split on `/`. A `+` level matches exactly one concrete level,
//! a trailing `#` matches zero or more trailing levels. Matching is
//! case-sensitive and pure, so it is safe to call from any number of fan-out
//! tasks at once.

use thiserror::Error;
use tracing::warn;

/// Level separator.
pub const LEVEL_SEPARATOR: char = '/';
/// Single-level wildcard.
pub const SINGLE_LEVEL: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL: &str = "#";

/// Reasons a subscription pattern is rejected before reaching the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// Pattern is the empty string.
    #[error("topic pattern is empty")]
    Empty,
    /// `#` appears before the final level.
    #[error("multi-level wildcard must be the last level: {0}")]
    MultiLevelNotLast(String),
    /// A wildcard shares a level with other characters (e.g. `a+`).
    #[error("wildcard must occupy a whole level: {0}")]
    PartialWildcard(String),
    /// Pattern contains a NUL character.
    #[error("topic pattern contains a NUL character")]
    NulCharacter,
}

/// Evaluate whether `topic` (a concrete publish topic) matches `pattern`.
///
/// A `#` that is not the final level never matches; it is logged and treated
/// as a literal mismatch rather than an error.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);
    let mut pattern_levels = pattern.split(LEVEL_SEPARATOR).peekable();

    while let Some(level) = pattern_levels.next() {
        if level == MULTI_LEVEL {
            if pattern_levels.peek().is_some() {
                warn!(pattern, "multi-level wildcard before final level, treating as mismatch");
                return false;
            }
            return true;
        }

        let Some(concrete) = topic_levels.next() else {
            return false;
        };

        if level != SINGLE_LEVEL && level != concrete {
            return false;
        }
    }

    topic_levels.next().is_none()
}

/// Check that `pattern` is a syntactically valid subscription filter.
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::Empty);
    }
    if pattern.contains('\0') {
        return Err(TopicError::NulCharacter);
    }

    let levels: Vec<&str> = pattern.split(LEVEL_SEPARATOR).collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != MULTI_LEVEL {
                return Err(TopicError::PartialWildcard(pattern.to_owned()));
            }
            if idx != last {
                return Err(TopicError::MultiLevelNotLast(pattern.to_owned()));
            }
        }
        if level.contains('+') && *level != SINGLE_LEVEL {
            return Err(TopicError::PartialWildcard(pattern.to_owned()));
        }
    }
    Ok(())
}

/// Whether `pattern` contains any wildcard level.
pub fn has_wildcards(pattern: &str) -> bool {
    pattern
        .split(LEVEL_SEPARATOR)
        .any(|level| level == SINGLE_LEVEL || level == MULTI_LEVEL)
}
