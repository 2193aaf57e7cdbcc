//! Delivery quality levels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery-assurance tier for a subscription or publish (MQTT `QoS`).
///
/// Serialized as the bare number (`0`, `1`, `2`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QualityLevel {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, may duplicate.
    AtLeastOnce,
    /// Four-way handshake, no duplicates.
    ExactlyOnce,
}

impl QualityLevel {
    /// Numeric level as used on the wire.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QualityLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(format!("invalid quality level: {other}")),
        }
    }
}

impl From<QualityLevel> for u8 {
    fn from(level: QualityLevel) -> Self {
        level.as_u8()
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qos{}", self.as_u8())
    }
}
