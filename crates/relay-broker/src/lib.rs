//! # relay-broker
//!
//! Broker-side half of the relay.
//!
//! - [`BrokerSessionManager`]: one session per configured broker connection;
//!   connect, subscribe bookkeeping, pause, message tagging, teardown notices
//! - [`Transport`] / [`TransportHandle`]: the boundary to a broker client
//! - [`MqttTransport`]: `rumqttc` implementation with an explicit reconnect policy
//! - [`test_utils::FakeTransport`]: scriptable in-process transport

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod mqtt;
pub mod test_utils;
pub mod transport;

pub use errors::{BrokerError, Result};
pub use manager::{BrokerEvent, BrokerSessionManager, ConnectionStatus, SessionSnapshot, SessionState};
pub use mqtt::MqttTransport;
pub use transport::{ErrorKind, Transport, TransportEvent, TransportHandle, TransportSession};
