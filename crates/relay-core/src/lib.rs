//! # relay-core
//!
//! Foundation types shared by every relay crate:
//!
//! - **Branded IDs**: `ConnectionId`, `SubscriptionId`, `ViewerId` as newtypes
//! - **Topic matching**: MQTT-style `+` / `#` wildcard evaluation and pattern validation
//! - **Endpoints**: [`BrokerEndpoint`] and [`Subscription`], what a broker session is opened with
//! - **Quality levels**: [`QualityLevel`] mirroring MQTT `QoS` 0/1/2
//! - **Inbound messages**: [`InboundMessage`] as handed from broker sessions to fan-out
//! - **Reconnect policy**: [`ReconnectPolicy`] with an explicit retry schedule
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` stack

#![deny(unsafe_code)]

pub mod endpoint;
pub mod ids;
pub mod logging;
pub mod message;
pub mod qos;
pub mod retry;
pub mod topic;

pub use endpoint::{BrokerEndpoint, Protocol, Subscription};
pub use ids::{ConnectionId, SubscriptionId, ViewerId};
pub use message::InboundMessage;
pub use qos::QualityLevel;
pub use retry::ReconnectPolicy;
pub use topic::{TopicError, matches, validate_pattern};
