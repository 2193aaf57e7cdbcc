//! Viewer session registry.
//!
//! Tracks every live viewer identity, the channel currently attached to it,
//! heartbeat liveness and the set of broker sessions it is bound to. The
//! table is guarded by one mutex that is never held across an `.await`;
//! channel sends are non-blocking `try_send`s.
//!
//! Each attachment of a channel to an identity gets a fresh attachment
//! number so that a channel replaced by a reattach cannot close the
//! identity when it later goes away.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{ConnectionId, ViewerId};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::ViewerEvent;

/// Outbound half of a viewer's WebSocket writer.
pub struct ViewerChannel {
    tx: mpsc::Sender<Arc<String>>,
    /// Count of messages dropped due to a full or closed channel.
    dropped_messages: AtomicU64,
}

impl ViewerChannel {
    /// Wrap the sender side of a writer queue.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            tx,
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a serialized frame.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue an event.
    pub fn send_event(&self, event: &ViewerEvent) -> bool {
        match event.encode() {
            Ok(frame) => self.send(frame),
            Err(err) => {
                warn!(error = %err, "failed to serialize viewer event");
                false
            }
        }
    }

    /// Total frames dropped on this channel.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A channel's claim on an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    /// Identity the channel is attached to.
    pub viewer_id: ViewerId,
    /// Attachment number, unique for the registry's lifetime.
    pub attachment: u64,
    /// Whether an existing identity was reused.
    pub reattached: bool,
}

/// Outcome of moving a channel onto a prior identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reattached {
    /// The channel's new claim.
    pub attachment: Attachment,
    /// Bindings the abandoned identity held; the caller must release them.
    pub released: Vec<ConnectionId>,
}

/// Read-only view of a viewer for the API.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSnapshot {
    /// Identity token.
    pub id: ViewerId,
    /// When the identity was first registered.
    pub created_at: DateTime<Utc>,
    /// Broker sessions the viewer is bound to.
    pub bindings: Vec<ConnectionId>,
    /// Consecutive unacknowledged heartbeat pings.
    pub missed_heartbeats: u32,
    /// Frames dropped on the current channel.
    pub dropped_messages: u64,
    /// Milliseconds since the last heartbeat acknowledgement.
    pub last_ack_ms: u64,
}

struct ViewerEntry {
    channel: Arc<ViewerChannel>,
    attachment: u64,
    created_at: DateTime<Utc>,
    last_ack: Instant,
    missed: u32,
    bindings: BTreeSet<ConnectionId>,
}

impl ViewerEntry {
    fn new(channel: Arc<ViewerChannel>, attachment: u64) -> Self {
        Self {
            channel,
            attachment,
            created_at: Utc::now(),
            last_ack: Instant::now(),
            missed: 0,
            bindings: BTreeSet::new(),
        }
    }

    fn attach(&mut self, channel: Arc<ViewerChannel>, attachment: u64) {
        self.channel = channel;
        self.attachment = attachment;
        self.last_ack = Instant::now();
        self.missed = 0;
    }
}

/// Owns every viewer identity.
#[derive(Default)]
pub struct ViewerRegistry {
    viewers: Mutex<HashMap<ViewerId, ViewerEntry>>,
    next_attachment: AtomicU64,
}

impl ViewerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_attachment(&self) -> u64 {
        self.next_attachment.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a new channel.
    ///
    /// If `prior_token` names a registered identity, the channel replaces
    /// that identity's current channel and its bindings are kept; otherwise
    /// a fresh, binding-free identity is minted. The viewer-scoped
    /// `status` event is queued on the new channel either way.
    pub fn open(&self, tx: mpsc::Sender<Arc<String>>, prior_token: Option<&ViewerId>) -> Attachment {
        let channel = Arc::new(ViewerChannel::new(tx));
        let attachment = self.next_attachment();

        let mut viewers = self.viewers.lock();
        let reused = prior_token.and_then(|token| {
            viewers.get_mut(token).map(|entry| {
                entry.attach(Arc::clone(&channel), attachment);
                token.clone()
            })
        });
        let reattached = reused.is_some();
        let viewer_id = reused.unwrap_or_else(|| {
            let id = ViewerId::new();
            let _ = viewers.insert(id.clone(), ViewerEntry::new(Arc::clone(&channel), attachment));
            id
        });
        drop(viewers);

        if reattached {
            info!(viewer_id = %viewer_id, attachment, "viewer reattached");
        } else {
            info!(viewer_id = %viewer_id, attachment, "viewer registered");
        }
        let _ = channel.send_event(&ViewerEvent::viewer_connected(&viewer_id, attachment));

        Attachment {
            viewer_id,
            attachment,
            reattached,
        }
    }

    /// Move the channel attached to `current` onto the identity `prior`.
    ///
    /// Returns `None` when `prior` is not registered, equals `current`, or
    /// when `current` is no longer held by `attachment`. On success the
    /// `current` identity is removed.
    pub fn reattach(&self, current: &ViewerId, attachment: u64, prior: &ViewerId) -> Option<Reattached> {
        if current == prior {
            return None;
        }
        let new_attachment = self.next_attachment();

        let mut viewers = self.viewers.lock();
        if !viewers.contains_key(prior) {
            return None;
        }
        if viewers.get(current).is_none_or(|e| e.attachment != attachment) {
            return None;
        }
        let abandoned = viewers.remove(current)?;
        let entry = viewers.get_mut(prior)?;
        entry.attach(Arc::clone(&abandoned.channel), new_attachment);
        drop(viewers);

        info!(from = %current, to = %prior, attachment = new_attachment, "viewer channel moved to prior identity");
        let _ = abandoned
            .channel
            .send_event(&ViewerEvent::viewer_connected(prior, new_attachment));

        Some(Reattached {
            attachment: Attachment {
                viewer_id: prior.clone(),
                attachment: new_attachment,
                reattached: true,
            },
            released: abandoned.bindings.into_iter().collect(),
        })
    }

    /// Record that `viewer` depends on `connection`.
    ///
    /// Returns `false` if the binding already existed or the viewer is unknown.
    pub fn bind(&self, viewer: &ViewerId, connection: &ConnectionId) -> bool {
        self.viewers
            .lock()
            .get_mut(viewer)
            .is_some_and(|e| e.bindings.insert(connection.clone()))
    }

    /// Remove a binding. Returns `false` if it did not exist.
    pub fn unbind(&self, viewer: &ViewerId, connection: &ConnectionId) -> bool {
        self.viewers
            .lock()
            .get_mut(viewer)
            .is_some_and(|e| e.bindings.remove(connection))
    }

    /// Broker sessions `viewer` is bound to.
    pub fn bindings(&self, viewer: &ViewerId) -> Vec<ConnectionId> {
        self.viewers
            .lock()
            .get(viewer)
            .map(|e| e.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of viewers bound to `connection`.
    pub fn binding_count(&self, connection: &ConnectionId) -> usize {
        self.viewers
            .lock()
            .values()
            .filter(|e| e.bindings.contains(connection))
            .count()
    }

    /// Remove every binding to `connection`, returning the viewers that had one.
    pub fn unbind_connection(&self, connection: &ConnectionId) -> Vec<ViewerId> {
        let mut viewers = self.viewers.lock();
        let mut unbound: Vec<ViewerId> = viewers
            .iter_mut()
            .filter_map(|(id, e)| e.bindings.remove(connection).then(|| id.clone()))
            .collect();
        unbound.sort();
        unbound
    }

    /// Remove every binding of `viewer`, keeping the identity registered.
    pub fn unbind_all(&self, viewer: &ViewerId) -> Vec<ConnectionId> {
        self.viewers
            .lock()
            .get_mut(viewer)
            .map(|e| std::mem::take(&mut e.bindings).into_iter().collect())
            .unwrap_or_default()
    }

    /// Ping every open channel.
    ///
    /// A viewer is reported dead when its channel is closed or when it has
    /// already missed `max_missed` consecutive pings; everyone else gets a
    /// `ping` event and one more miss on the books until it answers.
    pub fn heartbeat_tick(&self, max_missed: u32) -> Vec<ViewerId> {
        let ping = match ViewerEvent::Ping.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to serialize heartbeat ping");
                return Vec::new();
            }
        };

        let mut dead = Vec::new();
        let mut viewers = self.viewers.lock();
        for (id, entry) in viewers.iter_mut() {
            if entry.channel.is_closed() {
                debug!(viewer_id = %id, "viewer channel closed");
                dead.push(id.clone());
                continue;
            }
            if entry.missed >= max_missed.max(1) {
                warn!(viewer_id = %id, missed = entry.missed, "viewer missed heartbeats");
                dead.push(id.clone());
                continue;
            }
            entry.missed += 1;
            if !entry.channel.send(Arc::clone(&ping)) {
                debug!(viewer_id = %id, "heartbeat ping not queued");
            }
        }
        drop(viewers);
        dead.sort();
        dead
    }

    /// Record a heartbeat acknowledgement.
    pub fn mark_alive(&self, viewer: &ViewerId) {
        if let Some(entry) = self.viewers.lock().get_mut(viewer) {
            entry.missed = 0;
            entry.last_ack = Instant::now();
        }
    }

    /// Remove an identity and its channel, returning its bindings.
    pub fn close(&self, viewer: &ViewerId) -> Option<Vec<ConnectionId>> {
        let entry = self.viewers.lock().remove(viewer)?;
        info!(viewer_id = %viewer, bindings = entry.bindings.len(), "viewer closed");
        Some(entry.bindings.into_iter().collect())
    }

    /// Like [`Self::close`], but only if `attachment` still holds the identity.
    pub fn close_attachment(&self, viewer: &ViewerId, attachment: u64) -> Option<Vec<ConnectionId>> {
        let mut viewers = self.viewers.lock();
        if viewers.get(viewer)?.attachment != attachment {
            debug!(viewer_id = %viewer, attachment, "stale channel closed, identity kept");
            return None;
        }
        let entry = viewers.remove(viewer)?;
        drop(viewers);
        info!(viewer_id = %viewer, bindings = entry.bindings.len(), "viewer closed");
        Some(entry.bindings.into_iter().collect())
    }

    /// Drop every identity, closing all channels.
    pub fn close_all(&self) -> Vec<ViewerId> {
        let drained: Vec<ViewerId> = self.viewers.lock().drain().map(|(id, _)| id).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "all viewers closed");
        }
        drained
    }

    /// Send an event to one viewer.
    pub fn send(&self, viewer: &ViewerId, event: &ViewerEvent) -> bool {
        let channel = self.viewers.lock().get(viewer).map(|e| Arc::clone(&e.channel));
        channel.is_some_and(|c| c.send_event(event))
    }

    /// Every open channel, for fan-out.
    pub fn channels(&self) -> Vec<(ViewerId, Arc<ViewerChannel>)> {
        self.viewers
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.channel)))
            .collect()
    }

    /// Whether `viewer` is registered.
    pub fn contains(&self, viewer: &ViewerId) -> bool {
        self.viewers.lock().contains_key(viewer)
    }

    /// Number of registered viewers.
    pub fn len(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Whether no viewer is registered.
    pub fn is_empty(&self) -> bool {
        self.viewers.lock().is_empty()
    }

    /// Snapshots of every viewer, ordered by id.
    pub fn snapshot(&self) -> Vec<ViewerSnapshot> {
        let mut all: Vec<ViewerSnapshot> = self
            .viewers
            .lock()
            .iter()
            .map(|(id, e)| ViewerSnapshot {
                id: id.clone(),
                created_at: e.created_at,
                bindings: e.bindings.iter().cloned().collect(),
                missed_heartbeats: e.missed,
                dropped_messages: e.channel.drop_count(),
                last_ack_ms: u64::try_from(e.last_ack.elapsed().as_millis()).unwrap_or(u64::MAX),
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn channel() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(32)
    }

    fn next_json(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let frame = rx.try_recv().expect("no frame queued");
        serde_json::from_str(&frame).unwrap()
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test]
    fn open_mints_and_announces() {
        let registry = ViewerRegistry::new();
        let (tx, mut rx) = channel();
        let att = registry.open(tx, None);
        assert!(!att.reattached);
        assert!(registry.contains(&att.viewer_id));

        let status = next_json(&mut rx);
        assert_eq!(status["type"], "status");
        assert_eq!(status["scope"], "viewer");
        assert_eq!(status["id"], att.viewer_id.as_str());
        assert_eq!(status["wsClientId"], format!("ws-{}", att.attachment));
    }

    #[test]
    fn open_with_unknown_token_mints_fresh_identity() {
        let registry = ViewerRegistry::new();
        let (tx, _rx) = channel();
        let att = registry.open(tx, Some(&ViewerId::from("forgotten")));
        assert!(!att.reattached);
        assert_ne!(att.viewer_id.as_str(), "forgotten");
        assert!(registry.bindings(&att.viewer_id).is_empty());
    }

    #[test]
    fn open_with_prior_token_keeps_bindings() {
        let registry = ViewerRegistry::new();
        let (tx1, _rx1) = channel();
        let first = registry.open(tx1, None);
        assert!(registry.bind(&first.viewer_id, &conn("S")));

        let (tx2, _rx2) = channel();
        let second = registry.open(tx2, Some(&first.viewer_id));
        assert!(second.reattached);
        assert_eq!(second.viewer_id, first.viewer_id);
        assert_ne!(second.attachment, first.attachment);
        assert_eq!(registry.bindings(&second.viewer_id), vec![conn("S")]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_attachment_cannot_close_identity() {
        let registry = ViewerRegistry::new();
        let (tx1, _rx1) = channel();
        let first = registry.open(tx1, None);
        let (tx2, _rx2) = channel();
        let second = registry.open(tx2, Some(&first.viewer_id));

        assert!(registry.close_attachment(&first.viewer_id, first.attachment).is_none());
        assert!(registry.contains(&first.viewer_id));
        assert!(
            registry
                .close_attachment(&second.viewer_id, second.attachment)
                .is_some()
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn reattach_moves_channel_and_releases_abandoned_bindings() {
        let registry = ViewerRegistry::new();
        let (tx1, rx1) = channel();
        let prior = registry.open(tx1, None);
        assert!(registry.bind(&prior.viewer_id, &conn("A")));
        drop(rx1);

        let (tx2, mut rx2) = channel();
        let current = registry.open(tx2, None);
        assert!(registry.bind(&current.viewer_id, &conn("B")));
        let _ = next_json(&mut rx2);

        let moved = registry
            .reattach(&current.viewer_id, current.attachment, &prior.viewer_id)
            .unwrap();
        assert_eq!(moved.attachment.viewer_id, prior.viewer_id);
        assert_eq!(moved.released, vec![conn("B")]);
        assert!(!registry.contains(&current.viewer_id));
        assert_eq!(registry.bindings(&prior.viewer_id), vec![conn("A")]);

        let status = next_json(&mut rx2);
        assert_eq!(status["id"], prior.viewer_id.as_str());
    }

    #[test]
    fn reattach_unknown_or_same_token_is_none() {
        let registry = ViewerRegistry::new();
        let (tx, _rx) = channel();
        let att = registry.open(tx, None);
        assert!(
            registry
                .reattach(&att.viewer_id, att.attachment, &ViewerId::from("nope"))
                .is_none()
        );
        assert!(
            registry
                .reattach(&att.viewer_id, att.attachment, &att.viewer_id)
                .is_none()
        );
        assert!(registry.contains(&att.viewer_id));
    }

    #[test]
    fn bind_and_unbind_are_idempotent() {
        let registry = ViewerRegistry::new();
        let (tx, _rx) = channel();
        let v = registry.open(tx, None).viewer_id;
        assert!(registry.bind(&v, &conn("S")));
        assert!(!registry.bind(&v, &conn("S")));
        assert_eq!(registry.binding_count(&conn("S")), 1);
        assert!(registry.unbind(&v, &conn("S")));
        assert!(!registry.unbind(&v, &conn("S")));
        assert_eq!(registry.binding_count(&conn("S")), 0);
    }

    #[test]
    fn bind_unknown_viewer_fails() {
        let registry = ViewerRegistry::new();
        assert!(!registry.bind(&ViewerId::from("ghost"), &conn("S")));
    }

    #[test]
    fn unbind_connection_returns_affected_viewers() {
        let registry = ViewerRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let (tx3, _rx3) = channel();
        let a = registry.open(tx1, None).viewer_id;
        let b = registry.open(tx2, None).viewer_id;
        let c = registry.open(tx3, None).viewer_id;
        let _ = registry.bind(&a, &conn("S"));
        let _ = registry.bind(&b, &conn("S"));
        let _ = registry.bind(&c, &conn("T"));

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(registry.unbind_connection(&conn("S")), expected);
        assert_eq!(registry.binding_count(&conn("S")), 0);
        assert_eq!(registry.bindings(&c), vec![conn("T")]);
    }

    #[test]
    fn two_missed_pings_then_dead() {
        let registry = ViewerRegistry::new();
        let (tx, mut rx) = channel();
        let v = registry.open(tx, None).viewer_id;
        let _ = next_json(&mut rx);

        assert!(registry.heartbeat_tick(2).is_empty());
        assert_eq!(next_json(&mut rx)["type"], "ping");
        assert!(registry.heartbeat_tick(2).is_empty());
        assert_eq!(next_json(&mut rx)["type"], "ping");
        assert_eq!(registry.heartbeat_tick(2), vec![v]);
    }

    #[test]
    fn acknowledged_ping_resets_misses() {
        let registry = ViewerRegistry::new();
        let (tx, _rx) = channel();
        let v = registry.open(tx, None).viewer_id;
        for _ in 0..5 {
            assert!(registry.heartbeat_tick(2).is_empty());
            registry.mark_alive(&v);
        }
        assert_eq!(registry.snapshot()[0].missed_heartbeats, 0);
    }

    #[test]
    fn closed_channel_reported_dead_immediately() {
        let registry = ViewerRegistry::new();
        let (tx, rx) = channel();
        let v = registry.open(tx, None).viewer_id;
        drop(rx);
        assert_eq!(registry.heartbeat_tick(2), vec![v]);
    }

    #[test]
    fn close_returns_bindings_once() {
        let registry = ViewerRegistry::new();
        let (tx, _rx) = channel();
        let v = registry.open(tx, None).viewer_id;
        let _ = registry.bind(&v, &conn("S"));
        assert_eq!(registry.close(&v), Some(vec![conn("S")]));
        assert_eq!(registry.close(&v), None);
    }

    #[test]
    fn full_channel_counts_drops() {
        let registry = ViewerRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let v = registry.open(tx, None).viewer_id;
        // the status event filled the only slot
        assert!(!registry.send(&v, &ViewerEvent::Pong));
        assert_eq!(registry.snapshot()[0].dropped_messages, 1);
    }

    #[test]
    fn close_all_drops_channels() {
        let registry = ViewerRegistry::new();
        let (tx, mut rx) = channel();
        let _ = registry.open(tx, None);
        assert_eq!(registry.close_all().len(), 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(
            rx.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }
}
