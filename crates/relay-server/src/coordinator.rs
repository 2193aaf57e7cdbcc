//! Lifecycle coordinator.
//!
//! Binds broker sessions to viewer identities and unwinds bindings when
//! either side goes away:
//!
//! - a viewer asks to unsubscribe from a connection
//! - a viewer's channel closes or stops answering heartbeats
//! - a broker session closes
//!
//! After a binding is removed the coordinator re-counts the connection's
//! remaining bindings and asks the session manager to disconnect when none
//! are left. Binding a viewer and releasing a session both run under one
//! lock, so the count cannot change between the check and the disconnect.
//! Every unwinding step is safe to repeat.

use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use relay_broker::{BrokerSessionManager, ConnectionStatus};
use relay_core::{ConnectionId, Subscription, ViewerId};
use relay_store::{ConfigStore, StoreError};
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::errors::{RelayError, Result};
use crate::metrics::{BROKER_RELEASES_TOTAL, VIEWER_HEARTBEAT_TIMEOUTS_TOTAL};
use crate::registry::{Attachment, ViewerRegistry};

/// Owns the binding lifecycle between viewers and broker sessions.
pub struct LifecycleCoordinator {
    registry: Arc<ViewerRegistry>,
    manager: Arc<BrokerSessionManager>,
    store: Arc<dyn ConfigStore>,
    broadcaster: Broadcaster,
    lifecycle: Mutex<()>,
}

impl LifecycleCoordinator {
    /// Create a coordinator over the given registry, manager and store.
    pub fn new(
        registry: Arc<ViewerRegistry>,
        manager: Arc<BrokerSessionManager>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        Self {
            registry,
            manager,
            store,
            broadcaster,
            lifecycle: Mutex::new(()),
        }
    }

    /// Open (or reuse) the broker session for `connection_id` using its
    /// stored record and topics. Returns `true` if a new link was opened.
    fn open_session(&self, connection_id: &ConnectionId) -> Result<bool> {
        let record = self
            .store
            .connection(connection_id)?
            .ok_or_else(|| StoreError::connection_not_found(connection_id.as_str()))?;
        let subscriptions: Vec<Subscription> = self
            .store
            .topics(connection_id)?
            .iter()
            .map(relay_store::TopicRecord::subscription)
            .collect();
        Ok(self
            .manager
            .connect(connection_id, record.endpoint(), subscriptions)?)
    }

    /// Bind `viewer` to `connection_id`, opening the broker session if it
    /// is not already open.
    ///
    /// Returns `true` when a new broker link was opened. If opening fails
    /// the binding is rolled back.
    pub fn connect(&self, viewer: &ViewerId, connection_id: &ConnectionId) -> Result<bool> {
        if !self.registry.contains(viewer) {
            return Err(RelayError::viewer_not_found(viewer.as_str()));
        }
        if self.store.connection(connection_id)?.is_none() {
            return Err(StoreError::connection_not_found(connection_id.as_str()).into());
        }

        let lifecycle = self.lifecycle.lock();
        let newly_bound = self.registry.bind(viewer, connection_id);
        match self.open_session(connection_id) {
            Ok(opened) => {
                drop(lifecycle);
                info!(viewer_id = %viewer, connection_id = %connection_id, opened, "viewer bound to broker session");
                Ok(opened)
            }
            Err(err) => {
                if newly_bound {
                    let _ = self.registry.unbind(viewer, connection_id);
                }
                drop(lifecycle);
                if newly_bound {
                    self.release(connection_id);
                }
                warn!(viewer_id = %viewer, connection_id = %connection_id, error = %err, "broker session could not be opened");
                Err(err)
            }
        }
    }

    /// Drop the binding between `viewer` and `connection_id`.
    ///
    /// Returns `false` if there was no such binding.
    pub fn disconnect(&self, viewer: &ViewerId, connection_id: &ConnectionId) -> bool {
        if !self.registry.unbind(viewer, connection_id) {
            debug!(viewer_id = %viewer, connection_id = %connection_id, "no binding to remove");
            return false;
        }
        info!(viewer_id = %viewer, connection_id = %connection_id, "viewer unbound from broker session");
        self.release(connection_id);
        true
    }

    /// Disconnect the broker session if no viewer is bound to it anymore.
    fn release(&self, connection_id: &ConnectionId) {
        let _lifecycle = self.lifecycle.lock();
        let remaining = self.registry.binding_count(connection_id);
        if remaining > 0 {
            debug!(connection_id = %connection_id, remaining, "broker session still in use");
            return;
        }
        if self.manager.disconnect(connection_id) {
            counter!(BROKER_RELEASES_TOTAL).increment(1);
            info!(connection_id = %connection_id, "last viewer left, broker session closing");
        }
    }

    fn release_all(&self, connections: &[ConnectionId]) {
        for connection_id in connections {
            self.release(connection_id);
        }
    }

    /// The viewer identity is gone: unbind everything it held.
    pub fn viewer_closed(&self, viewer: &ViewerId) -> Vec<ConnectionId> {
        let released = self.registry.close(viewer).unwrap_or_default();
        self.release_all(&released);
        released
    }

    /// A channel went away. Only closes the identity if the channel still
    /// holds it; a channel replaced by a reattach leaves the identity alone.
    pub fn channel_closed(&self, attachment: &Attachment) -> Vec<ConnectionId> {
        let released = self
            .registry
            .close_attachment(&attachment.viewer_id, attachment.attachment)
            .unwrap_or_default();
        self.release_all(&released);
        released
    }

    /// A broker link closed: unbind every viewer from its session.
    ///
    /// A notice for a link that has since been replaced is ignored; the
    /// viewers belong to the new link.
    pub fn broker_closed(&self, connection_id: &ConnectionId, generation: u64) -> Vec<ViewerId> {
        let _lifecycle = self.lifecycle.lock();
        if self.manager.is_superseded(connection_id, generation) {
            debug!(connection_id = %connection_id, generation, "stale teardown ignored");
            return Vec::new();
        }
        self.unbind_connection(connection_id)
    }

    fn unbind_connection(&self, connection_id: &ConnectionId) -> Vec<ViewerId> {
        let unbound = self.registry.unbind_connection(connection_id);
        if !unbound.is_empty() {
            info!(connection_id = %connection_id, viewers = unbound.len(), "broker session closed, viewers unbound");
        }
        unbound
    }

    /// Move the channel held by `current` onto the identity `prior`.
    ///
    /// Bindings held only by the abandoned `current` identity are released.
    /// Returns `None` if `prior` is not registered.
    pub fn reattach(&self, current: &Attachment, prior: &ViewerId) -> Option<Attachment> {
        let moved = self
            .registry
            .reattach(&current.viewer_id, current.attachment, prior)?;
        self.release_all(&moved.released);
        Some(moved.attachment)
    }

    /// Release every binding held by `token`.
    ///
    /// The identity itself is closed unless it is `current`, the identity of
    /// the asking channel.
    pub fn cleanup(&self, token: &ViewerId, current: &ViewerId) -> Vec<ConnectionId> {
        if token == current {
            let released = self.registry.unbind_all(token);
            self.release_all(&released);
            released
        } else {
            self.viewer_closed(token)
        }
    }

    /// Run one heartbeat round and close every viewer that failed it.
    pub fn sweep_heartbeats(&self, max_missed: u32) -> Vec<ViewerId> {
        let dead = self.registry.heartbeat_tick(max_missed);
        for viewer in &dead {
            counter!(VIEWER_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
            let released = self.viewer_closed(viewer);
            info!(viewer_id = %viewer, released = released.len(), "viewer closed by heartbeat");
        }
        dead
    }

    /// Open a broker session on behalf of an operator, without a viewer binding.
    pub fn admin_connect(&self, connection_id: &ConnectionId) -> Result<bool> {
        self.open_session(connection_id)
    }

    /// Close a broker session regardless of bindings. Viewers are unbound
    /// when the session's teardown notice arrives.
    pub fn admin_disconnect(&self, connection_id: &ConnectionId) -> bool {
        self.manager.disconnect(connection_id)
    }

    /// Forget a connection entirely: unbind viewers, close and drop its
    /// broker session.
    pub fn remove_connection(&self, connection_id: &ConnectionId) {
        let _ = self.unbind_connection(connection_id);
        let was_open = self.manager.is_open(connection_id);
        if self.manager.remove(connection_id) && was_open {
            let _ = self
                .broadcaster
                .broadcast_status(connection_id, ConnectionStatus::Disconnected, None);
        }
    }

    /// Viewer registry.
    pub fn registry(&self) -> &Arc<ViewerRegistry> {
        &self.registry
    }

    /// Broker session manager.
    pub fn manager(&self) -> &Arc<BrokerSessionManager> {
        &self.manager
    }

    /// Configuration store.
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }
}
