//! Broker session manager.
//!
//! Owns one transport link per configured broker connection. Every link's
//! events are processed in order by a dedicated pump task and surfaced to
//! the rest of the relay as [`BrokerEvent`]s on a single unbounded channel,
//! which preserves per-session order.
//!
//! The session table is guarded by one mutex that is never held across an
//! `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use relay_core::{
    BrokerEndpoint, ConnectionId, InboundMessage, QualityLevel, ReconnectPolicy, Subscription,
    SubscriptionId, matches, validate_pattern,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::errors::{BrokerError, Result};
use crate::transport::{ErrorKind, Transport, TransportEvent, TransportHandle};

/// Connection state of a broker session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Known but no link attempted yet. `connect` moves a new session out
    /// of this state before releasing the session lock, so snapshots do not
    /// report it.
    Idle,
    /// Link opened, waiting for the broker.
    Connecting,
    /// Broker accepted the link.
    Connected,
    /// Last attempt failed; the transport may still retry.
    Error,
    /// Link gone; handle dropped.
    Closed,
}

/// Status reported to viewers for a broker session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Link opened, waiting for the broker.
    Connecting,
    /// Broker accepted the link.
    Connected,
    /// A link attempt failed.
    Error,
    /// The link is gone.
    Disconnected,
}

impl ConnectionStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }
}

/// What the manager tells the rest of the relay.
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    /// Session status changed.
    Status {
        /// Session the status belongs to.
        connection_id: ConnectionId,
        /// New status.
        status: ConnectionStatus,
        /// Failure description for [`ConnectionStatus::Error`].
        message: Option<String>,
    },
    /// A message matched (or at least arrived on) an unpaused session.
    Message(InboundMessage),
    /// The session closed; viewers bound to it must be unbound.
    Teardown {
        /// Session that closed.
        connection_id: ConnectionId,
        /// Link that closed. A later link on the same session makes the
        /// notice stale, see [`BrokerSessionManager::is_superseded`].
        generation: u64,
    },
}

/// Read-only view of one session for the API and health endpoints.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session id.
    pub connection_id: ConnectionId,
    /// `protocol://host:port`.
    pub url: String,
    /// Connection state.
    pub state: SessionState,
    /// Whether forwarding is paused.
    pub paused: bool,
    /// Subscriptions held by the session.
    pub subscriptions: Vec<Subscription>,
    /// Last failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Messages received since the session was created.
    pub messages_received: u64,
    /// Messages received while paused.
    pub messages_suppressed: u64,
}

struct BrokerSession {
    endpoint: BrokerEndpoint,
    state: SessionState,
    paused: bool,
    subscriptions: Vec<Subscription>,
    handle: Option<Box<dyn TransportHandle>>,
    closing: bool,
    generation: u64,
    last_error: Option<String>,
    messages_received: u64,
    messages_suppressed: u64,
}

impl BrokerSession {
    fn new(endpoint: BrokerEndpoint, subscriptions: Vec<Subscription>) -> Self {
        Self {
            endpoint,
            state: SessionState::Idle,
            paused: false,
            subscriptions,
            handle: None,
            closing: false,
            generation: 0,
            last_error: None,
            messages_received: 0,
            messages_suppressed: 0,
        }
    }

    fn snapshot(&self, connection_id: &ConnectionId) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: connection_id.clone(),
            url: self.endpoint.url(),
            state: self.state,
            paused: self.paused,
            subscriptions: self.subscriptions.clone(),
            last_error: self.last_error.clone(),
            messages_received: self.messages_received,
            messages_suppressed: self.messages_suppressed,
        }
    }

    fn is_live(&self) -> bool {
        self.handle.is_some() && self.state == SessionState::Connected
    }

    /// Issue a subscribe on the live link, logging a transport refusal.
    fn send_subscribe(&self, connection_id: &ConnectionId, pattern: &str, qos: QualityLevel) {
        if let Some(handle) = &self.handle {
            if let Err(err) = handle.subscribe(pattern, qos) {
                warn!(connection_id = %connection_id, pattern, error = %err, "transport rejected subscribe");
            }
        }
    }

    fn send_unsubscribe(&self, connection_id: &ConnectionId, pattern: &str) {
        if let Some(handle) = &self.handle {
            if let Err(err) = handle.unsubscribe(pattern) {
                warn!(connection_id = %connection_id, pattern, error = %err, "transport rejected unsubscribe");
            }
        }
    }
}

/// Owns every broker session.
pub struct BrokerSessionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    sessions: Mutex<HashMap<ConnectionId, BrokerSession>>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    next_generation: Mutex<u64>,
}

impl BrokerSessionManager {
    /// Create a manager. Events are delivered to the returned receiver.
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            transport,
            policy,
            sessions: Mutex::new(HashMap::new()),
            events: tx,
            next_generation: Mutex::new(0),
        });
        (manager, rx)
    }

    /// Open a broker session, or do nothing if its link is already open.
    ///
    /// Returns `true` when a new link was opened. A link that is closing
    /// counts as gone: it is replaced, and its remaining events are dropped.
    /// `subscriptions` replaces the session's subscription set only when a
    /// link is opened. Must be called from within a Tokio runtime.
    pub fn connect(
        self: &Arc<Self>,
        connection_id: &ConnectionId,
        endpoint: BrokerEndpoint,
        subscriptions: Vec<Subscription>,
    ) -> Result<bool> {
        let subscriptions: Vec<Subscription> = subscriptions
            .into_iter()
            .filter(|s| match validate_pattern(&s.pattern) {
                Ok(()) => true,
                Err(err) => {
                    warn!(connection_id = %connection_id, pattern = %s.pattern, error = %err, "skipping invalid subscription");
                    false
                }
            })
            .collect();

        let mut sessions = self.sessions.lock();
        if sessions
            .get(connection_id)
            .is_some_and(|s| s.handle.is_some() && !s.closing)
        {
            debug!(connection_id = %connection_id, "broker session already open");
            return Ok(false);
        }

        let opened = match self.transport.open(connection_id, &endpoint, &self.policy) {
            Ok(opened) => opened,
            Err(err) => {
                let session = sessions
                    .entry(connection_id.clone())
                    .or_insert_with(|| BrokerSession::new(endpoint.clone(), Vec::new()));
                session.state = SessionState::Error;
                session.last_error = Some(err.to_string());
                drop(sessions);
                self.emit_status(connection_id, ConnectionStatus::Error, Some(err.to_string()));
                return Err(err);
            }
        };

        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };

        let session = sessions
            .entry(connection_id.clone())
            .or_insert_with(|| BrokerSession::new(endpoint.clone(), Vec::new()));
        if session.closing {
            debug!(connection_id = %connection_id, "replacing closing broker link");
        }
        session.endpoint = endpoint;
        session.subscriptions = subscriptions;
        let superseded = session.handle.replace(opened.handle);
        session.closing = false;
        session.state = SessionState::Connecting;
        session.generation = generation;
        session.last_error = None;
        let url = session.endpoint.url();
        drop(sessions);
        drop(superseded);

        info!(connection_id = %connection_id, %url, "broker session opening");
        self.emit_status(connection_id, ConnectionStatus::Connecting, None);

        let manager = Arc::clone(self);
        let id = connection_id.clone();
        let mut events = opened.events;
        let span = info_span!("broker_pump", connection_id = %connection_id);
        let _ = tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    if manager.handle_event(&id, generation, event) {
                        return;
                    }
                }
                // stream ended without an explicit close
                let _ = manager.handle_event(&id, generation, TransportEvent::Closed);
            }
            .instrument(span),
        );

        Ok(true)
    }

    /// Process one transport event. Returns `true` once the link is closed.
    fn handle_event(&self, connection_id: &ConnectionId, generation: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Connected => {
                let mut sessions = self.sessions.lock();
                let Some(session) = current(&mut sessions, connection_id, generation) else {
                    return true;
                };
                session.state = SessionState::Connected;
                session.last_error = None;
                for sub in session.subscriptions.iter().filter(|s| s.active) {
                    session.send_subscribe(connection_id, &sub.pattern, sub.qos);
                }
                drop(sessions);
                info!(connection_id = %connection_id, "broker session connected");
                self.emit_status(connection_id, ConnectionStatus::Connected, None);
                false
            }
            TransportEvent::Error { code, message } => {
                let kind = ErrorKind::from_code(code);
                let text = kind.describe(&message);
                let mut sessions = self.sessions.lock();
                let Some(session) = current(&mut sessions, connection_id, generation) else {
                    return true;
                };
                session.state = SessionState::Error;
                session.last_error = Some(text.clone());
                drop(sessions);
                warn!(connection_id = %connection_id, ?kind, error = %message, "broker session error");
                self.emit_status(connection_id, ConnectionStatus::Error, Some(text));
                false
            }
            TransportEvent::Closed => {
                let mut sessions = self.sessions.lock();
                let Some(session) = current(&mut sessions, connection_id, generation) else {
                    return true;
                };
                session.state = SessionState::Closed;
                session.closing = false;
                let handle = session.handle.take();
                drop(sessions);
                drop(handle);
                info!(connection_id = %connection_id, "broker session closed");
                self.emit_status(connection_id, ConnectionStatus::Disconnected, None);
                self.emit(BrokerEvent::Teardown {
                    connection_id: connection_id.clone(),
                    generation,
                });
                true
            }
            TransportEvent::Message {
                topic,
                payload,
                qos,
                retained,
            } => {
                let message = self.on_message(connection_id, generation, topic, payload, qos, retained);
                if let Some(message) = message {
                    self.emit(BrokerEvent::Message(message));
                }
                false
            }
        }
    }

    /// Tag an inbound publish with its matching patterns, or drop it if the
    /// session is paused.
    fn on_message(
        &self,
        connection_id: &ConnectionId,
        generation: u64,
        topic: String,
        payload: Bytes,
        qos: QualityLevel,
        retained: bool,
    ) -> Option<InboundMessage> {
        let mut sessions = self.sessions.lock();
        let session = current(&mut sessions, connection_id, generation)?;
        session.messages_received += 1;
        counter!("relay_broker_messages_total").increment(1);
        if session.paused {
            session.messages_suppressed += 1;
            counter!("relay_broker_messages_suppressed_total").increment(1);
            debug!(connection_id = %connection_id, %topic, "session paused, message not forwarded");
            return None;
        }
        let patterns: Vec<String> = session
            .subscriptions
            .iter()
            .filter(|s| s.active && matches(&topic, &s.pattern))
            .map(|s| s.pattern.clone())
            .collect();
        drop(sessions);

        Some(
            InboundMessage::new(connection_id.clone(), topic, payload, qos, retained)
                .with_patterns(patterns),
        )
    }

    /// Ask the session's link to shut down.
    ///
    /// Returns `true` if a shutdown was requested; unknown, closed and
    /// already-closing sessions are a no-op.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(connection_id) else {
            return false;
        };
        if session.closing {
            return false;
        }
        let Some(handle) = &session.handle else {
            return false;
        };
        handle.disconnect();
        session.closing = true;
        info!(connection_id = %connection_id, "broker session disconnect requested");
        true
    }

    /// Request shutdown of every open session, returning the ids asked.
    pub fn disconnect_all(&self) -> Vec<ConnectionId> {
        let ids: Vec<ConnectionId> = self.sessions.lock().keys().cloned().collect();
        ids.into_iter().filter(|id| self.disconnect(id)).collect()
    }

    /// Forget a session entirely, closing its link first if open.
    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        let _ = self.disconnect(connection_id);
        self.sessions.lock().remove(connection_id).is_some()
    }

    /// Toggle forwarding for a session.
    pub fn set_paused(&self, connection_id: &ConnectionId, paused: bool) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(connection_id)
            .ok_or_else(|| BrokerError::UnknownSession(connection_id.clone()))?;
        session.paused = paused;
        info!(connection_id = %connection_id, paused, "broker session pause changed");
        Ok(())
    }

    /// Activate or deactivate a subscription wherever it is held.
    ///
    /// Returns `false` if no session holds the subscription; the caller's
    /// stored record is the source of truth either way.
    pub fn set_subscription_active(&self, subscription_id: &SubscriptionId, active: bool) -> bool {
        let mut sessions = self.sessions.lock();
        for (connection_id, session) in sessions.iter_mut() {
            let Some(idx) = session.subscriptions.iter().position(|s| &s.id == subscription_id) else {
                continue;
            };
            let was_active = session.subscriptions[idx].active;
            session.subscriptions[idx].active = active;
            if session.is_live() && was_active != active {
                let sub = &session.subscriptions[idx];
                if active {
                    session.send_subscribe(connection_id, &sub.pattern, sub.qos);
                } else {
                    session.send_unsubscribe(connection_id, &sub.pattern);
                }
            }
            return true;
        }
        false
    }

    /// Add or replace a subscription on a known session.
    pub fn add_subscription(&self, connection_id: &ConnectionId, subscription: Subscription) -> Result<()> {
        validate_pattern(&subscription.pattern)?;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(connection_id)
            .ok_or_else(|| BrokerError::UnknownSession(connection_id.clone()))?;

        let replaced = session
            .subscriptions
            .iter()
            .position(|s| s.id == subscription.id)
            .map(|idx| session.subscriptions.remove(idx));
        if let Some(old) = &replaced {
            if old.active && session.is_live() && old.pattern != subscription.pattern {
                session.send_unsubscribe(connection_id, &old.pattern);
            }
        }
        if subscription.active && session.is_live() {
            session.send_subscribe(connection_id, &subscription.pattern, subscription.qos);
        }
        session.subscriptions.push(subscription);
        Ok(())
    }

    /// Drop a subscription from whichever session holds it.
    pub fn remove_subscription(&self, subscription_id: &SubscriptionId) -> bool {
        let mut sessions = self.sessions.lock();
        for (connection_id, session) in sessions.iter_mut() {
            let Some(idx) = session.subscriptions.iter().position(|s| &s.id == subscription_id) else {
                continue;
            };
            let removed = session.subscriptions.remove(idx);
            if removed.active && session.is_live() {
                session.send_unsubscribe(connection_id, &removed.pattern);
            }
            return true;
        }
        false
    }

    /// Snapshot of one session.
    pub fn snapshot(&self, connection_id: &ConnectionId) -> Option<SessionSnapshot> {
        self.sessions
            .lock()
            .get(connection_id)
            .map(|s| s.snapshot(connection_id))
    }

    /// Snapshots of every known session, ordered by id.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| s.snapshot(id))
            .collect();
        all.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        all
    }

    /// Whether the manager knows the session.
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.sessions.lock().contains_key(connection_id)
    }

    /// Whether `generation` is no longer the session's current link.
    ///
    /// A forgotten session is not superseded: its last teardown still counts.
    pub fn is_superseded(&self, connection_id: &ConnectionId, generation: u64) -> bool {
        self.sessions
            .lock()
            .get(connection_id)
            .is_some_and(|s| s.generation != generation)
    }

    /// Whether the session has an open link (any state but closed/idle).
    pub fn is_open(&self, connection_id: &ConnectionId) -> bool {
        self.sessions
            .lock()
            .get(connection_id)
            .is_some_and(|s| s.handle.is_some())
    }

    /// Number of sessions with an open link.
    pub fn open_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.handle.is_some())
            .count()
    }

    fn emit_status(&self, connection_id: &ConnectionId, status: ConnectionStatus, message: Option<String>) {
        self.emit(BrokerEvent::Status {
            connection_id: connection_id.clone(),
            status,
            message,
        });
    }

    fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).is_err() {
            debug!("broker event receiver dropped");
        }
    }
}

/// The session for `connection_id` if `generation` is its current link.
fn current<'a>(
    sessions: &'a mut HashMap<ConnectionId, BrokerSession>,
    connection_id: &ConnectionId,
    generation: u64,
) -> Option<&'a mut BrokerSession> {
    sessions
        .get_mut(connection_id)
        .filter(|s| s.generation == generation && s.handle.is_some())
}
