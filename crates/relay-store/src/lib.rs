//! # relay-store
//!
//! Persisted broker connection and topic records.
//!
//! - [`ConfigStore`]: the read/write interface the rest of the relay uses
//! - [`JsonFileStore`]: single-file JSON implementation (`~/.relay/connections.json`)
//!
//! Message content is never persisted.

#![deny(unsafe_code)]

pub mod errors;
pub mod store;
pub mod types;

pub use errors::{Result, StoreError};
pub use store::{ConfigStore, JsonFileStore};
pub use types::{ConnectionRecord, StoreData, StoredMessage, TopicRecord};
