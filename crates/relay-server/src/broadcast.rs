//! Fan-out of broker traffic to viewer channels.
//!
//! Every event is serialized once and queued on each open channel with a
//! non-blocking send. A full or closed channel is logged and counted and
//! delivery to the others continues; the next heartbeat tick re-checks it.

use std::sync::Arc;

use metrics::counter;
use relay_broker::ConnectionStatus;
use relay_core::{ConnectionId, InboundMessage};
use tracing::{debug, warn};

use crate::metrics::BROADCAST_DROPS_TOTAL;
use crate::protocol::ViewerEvent;
use crate::registry::ViewerRegistry;

/// Sends events to every open viewer channel.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ViewerRegistry>,
}

impl Broadcaster {
    /// Fan out over the channels held by `registry`.
    pub fn new(registry: Arc<ViewerRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver a broker message to every open viewer channel.
    ///
    /// Returns the number of channels the message was queued on.
    pub fn deliver(&self, message: &InboundMessage) -> usize {
        self.broadcast(&ViewerEvent::from_message(message))
    }

    /// Announce a broker session status change to every viewer.
    pub fn broadcast_status(
        &self,
        connection_id: &ConnectionId,
        status: ConnectionStatus,
        message: Option<String>,
    ) -> usize {
        self.broadcast(&ViewerEvent::connection_status(connection_id, status, message))
    }

    /// Queue `event` on every open channel.
    pub fn broadcast(&self, event: &ViewerEvent) -> usize {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to serialize broadcast event");
                return 0;
            }
        };
        let channels = self.registry.channels();
        let mut delivered = 0;
        for (viewer_id, channel) in &channels {
            if channel.send(Arc::clone(&frame)) {
                delivered += 1;
            } else {
                counter!(BROADCAST_DROPS_TOTAL).increment(1);
                warn!(viewer_id = %viewer_id, dropped = channel.drop_count(), "failed to queue event for viewer");
            }
        }
        debug!(recipients = channels.len(), delivered, "broadcast event to all");
        delivered
    }
}
