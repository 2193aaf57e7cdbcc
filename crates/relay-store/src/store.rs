//! Configuration store trait and JSON-file implementation.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use relay_core::{ConnectionId, SubscriptionId, validate_pattern};
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::types::{ConnectionRecord, STORE_VERSION, StoreData, StoredMessage, TopicRecord};

/// Read/write access to connection and topic records.
///
/// Implementations are shared behind `Arc` by the API layer and the
/// lifecycle coordinator.
pub trait ConfigStore: Send + Sync {
    /// Look up one connection.
    fn connection(&self, id: &ConnectionId) -> Result<Option<ConnectionRecord>>;
    /// All connections, in insertion order.
    fn connections(&self) -> Result<Vec<ConnectionRecord>>;
    /// Insert or replace a connection; `created_at` of an existing record is kept.
    fn upsert_connection(&self, record: ConnectionRecord) -> Result<ConnectionRecord>;
    /// Remove a connection and every topic that belongs to it.
    ///
    /// Returns whether a record was removed.
    fn delete_connection(&self, id: &ConnectionId) -> Result<bool>;
    /// Topics of one connection.
    fn topics(&self, connection: &ConnectionId) -> Result<Vec<TopicRecord>>;
    /// Look up one topic.
    fn topic(&self, id: &SubscriptionId) -> Result<Option<TopicRecord>>;
    /// Insert or replace a topic. The pattern is validated and the owning
    /// connection must exist.
    fn upsert_topic(&self, record: TopicRecord) -> Result<TopicRecord>;
    /// Remove a topic, returning the removed record.
    fn delete_topic(&self, id: &SubscriptionId) -> Result<Option<TopicRecord>>;
    /// Flip the active flag of a topic.
    fn set_topic_active(&self, id: &SubscriptionId, active: bool) -> Result<TopicRecord>;
    /// Most recent messages seen on a topic, newest first.
    fn recent_messages(
        &self,
        connection: &ConnectionId,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;
}

/// Store backed by a single pretty-printed JSON file.
///
/// The whole document is held in memory and rewritten on every mutation.
/// No message content is stored, so [`ConfigStore::recent_messages`] is
/// always empty.
#[derive(Debug)]
pub struct JsonFileStore {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = load(&path)?;
        info!(
            path = %path.display(),
            connections = data.connections.len(),
            topics = data.topics.len(),
            "configuration store opened"
        );
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply `f` to a copy of the document, persist it, then swap it in.
    ///
    /// The in-memory state only changes when the write succeeded.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut guard = self.data.write();
        let mut next = (*guard).clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            save(path, &next)?;
        }
        *guard = next;
        Ok(out)
    }
}

impl ConfigStore for JsonFileStore {
    fn connection(&self, id: &ConnectionId) -> Result<Option<ConnectionRecord>> {
        Ok(self.data.read().connections.iter().find(|c| &c.id == id).cloned())
    }

    fn connections(&self) -> Result<Vec<ConnectionRecord>> {
        Ok(self.data.read().connections.clone())
    }

    fn upsert_connection(&self, mut record: ConnectionRecord) -> Result<ConnectionRecord> {
        if record.host.trim().is_empty() {
            return Err(StoreError::InvalidRecord("host must not be empty".into()));
        }
        if record.port == 0 {
            return Err(StoreError::InvalidRecord("port must be positive".into()));
        }
        self.mutate(|data| {
            record.updated_at = Utc::now();
            if let Some(existing) = data.connections.iter_mut().find(|c| c.id == record.id) {
                record.created_at = existing.created_at;
                *existing = record.clone();
            } else {
                data.connections.push(record.clone());
            }
            debug!(connection_id = %record.id, "connection record saved");
            Ok(record)
        })
    }

    fn delete_connection(&self, id: &ConnectionId) -> Result<bool> {
        self.mutate(|data| {
            let before = data.connections.len();
            data.connections.retain(|c| &c.id != id);
            let removed = data.connections.len() != before;
            if removed {
                let topics_before = data.topics.len();
                data.topics.retain(|t| &t.connection_id != id);
                debug!(
                    connection_id = %id,
                    topics_removed = topics_before - data.topics.len(),
                    "connection record deleted"
                );
            }
            Ok(removed)
        })
    }

    fn topics(&self, connection: &ConnectionId) -> Result<Vec<TopicRecord>> {
        Ok(self
            .data
            .read()
            .topics
            .iter()
            .filter(|t| &t.connection_id == connection)
            .cloned()
            .collect())
    }

    fn topic(&self, id: &SubscriptionId) -> Result<Option<TopicRecord>> {
        Ok(self.data.read().topics.iter().find(|t| &t.id == id).cloned())
    }

    fn upsert_topic(&self, record: TopicRecord) -> Result<TopicRecord> {
        validate_pattern(&record.pattern)?;
        self.mutate(|data| {
            if !data.connections.iter().any(|c| c.id == record.connection_id) {
                return Err(StoreError::connection_not_found(
                    record.connection_id.as_str(),
                ));
            }
            if let Some(existing) = data.topics.iter_mut().find(|t| t.id == record.id) {
                *existing = record.clone();
            } else {
                data.topics.push(record.clone());
            }
            Ok(record)
        })
    }

    fn delete_topic(&self, id: &SubscriptionId) -> Result<Option<TopicRecord>> {
        self.mutate(|data| {
            let pos = data.topics.iter().position(|t| &t.id == id);
            Ok(pos.map(|p| data.topics.remove(p)))
        })
    }

    fn set_topic_active(&self, id: &SubscriptionId, active: bool) -> Result<TopicRecord> {
        self.mutate(|data| {
            let topic = data
                .topics
                .iter_mut()
                .find(|t| &t.id == id)
                .ok_or_else(|| StoreError::topic_not_found(id.as_str()))?;
            topic.active = active;
            Ok(topic.clone())
        })
    }

    fn recent_messages(
        &self,
        _connection: &ConnectionId,
        _topic: &str,
        _limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        Ok(Vec::new())
    }
}

fn load(path: &Path) -> Result<StoreData> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "store file not found, starting empty");
            return Ok(StoreData::default());
        }
        Err(e) => return Err(e.into()),
    };
    let data: StoreData = serde_json::from_str(&content)?;
    if data.version != STORE_VERSION {
        warn!(version = data.version, "unexpected store version, reading anyway");
    }
    Ok(data)
}

/// Write via a sibling temp file and rename so readers never see a torn file.
fn save(path: &Path, data: &StoreData) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(data)?;
    std::fs::write(&tmp, json)?;

    // records may hold broker passwords
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}
