//! # relay-server
//!
//! Viewer-facing half of the relay and the HTTP surface around it.
//!
//! - [`registry::ViewerRegistry`]: live viewer channels, identities, bindings, heartbeat
//! - [`broadcast::Broadcaster`]: fan-out of broker traffic to every open viewer channel
//! - [`coordinator::LifecycleCoordinator`]: binds broker sessions to viewers and
//!   unwinds bindings when either side goes away
//! - [`router`]: single dispatch point for broker-side events
//! - [`websocket`]: per-viewer session task and request dispatch
//! - [`api`]: REST management of connection and topic records
//! - [`server::RelayServer`]: wiring, listener, graceful shutdown

#![deny(unsafe_code)]

pub mod api;
pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{RelayError, Result};
pub use server::{AppState, RelayServer};
