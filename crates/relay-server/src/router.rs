//! Broker event router.
//!
//! The single consumer of the session manager's event channel. Messages and
//! status changes go to the broadcaster, teardown notices to the
//! coordinator. Because there is exactly one consumer, every viewer channel
//! sees a session's events in the order the session produced them.

use std::sync::Arc;

use relay_broker::BrokerEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::broadcast::Broadcaster;
use crate::coordinator::LifecycleCoordinator;

/// Route one broker event.
pub fn dispatch(event: BrokerEvent, broadcaster: &Broadcaster, coordinator: &LifecycleCoordinator) {
    match event {
        BrokerEvent::Message(message) => {
            let delivered = broadcaster.deliver(&message);
            debug!(connection_id = %message.connection_id, topic = %message.topic, delivered, "message fanned out");
        }
        BrokerEvent::Status {
            connection_id,
            status,
            message,
        } => {
            let _ = broadcaster.broadcast_status(&connection_id, status, message);
        }
        BrokerEvent::Teardown {
            connection_id,
            generation,
        } => {
            let _ = coordinator.broker_closed(&connection_id, generation);
        }
    }
}

/// Consume broker events until the channel closes or `cancel` fires.
#[instrument(skip_all)]
pub async fn run_event_router(
    mut events: mpsc::UnboundedReceiver<BrokerEvent>,
    broadcaster: Broadcaster,
    coordinator: Arc<LifecycleCoordinator>,
    cancel: CancellationToken,
) {
    info!("broker event router started");
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => dispatch(event, &broadcaster, &coordinator),
                    None => break,
                }
            }
            () = cancel.cancelled() => break,
        }
    }
    info!("broker event router stopped");
}
