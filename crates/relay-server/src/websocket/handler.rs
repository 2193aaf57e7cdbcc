//! Viewer request dispatch: parses an incoming frame as a [`ViewerRequest`]
//! and routes it to the coordinator.

use metrics::counter;
use relay_broker::{ConnectionStatus, SessionState};
use relay_core::ConnectionId;
use relay_store::StoreError;
use tracing::{debug, instrument, warn};

use crate::coordinator::LifecycleCoordinator;
use crate::errors::{RelayError, Result};
use crate::metrics::VIEWER_REQUESTS_TOTAL;
use crate::protocol::{BatchEntry, ErrorCode, ViewerEvent, ViewerRequest};
use crate::registry::Attachment;

/// Handle one text frame from a viewer.
///
/// `attachment` is updated in place when a `register` request moves the
/// channel onto a prior identity. Returns the events to send back on this
/// viewer's channel only; broadcast traffic is not included.
#[instrument(skip_all, fields(viewer_id = %attachment.viewer_id, request_type))]
pub fn handle_message(
    text: &str,
    attachment: &mut Attachment,
    coordinator: &LifecycleCoordinator,
) -> Vec<ViewerEvent> {
    let request: ViewerRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "invalid viewer request");
            return vec![ViewerEvent::error(
                ErrorCode::InvalidRequest,
                format!("invalid request: {err}"),
                request_type_hint(text).as_deref(),
            )];
        }
    };

    let request_type = request.request_type();
    let _ = tracing::Span::current().record("request_type", request_type);
    counter!(VIEWER_REQUESTS_TOTAL, "type" => request_type).increment(1);
    debug!("dispatching viewer request");

    match dispatch(request, attachment, coordinator) {
        Ok(replies) => replies,
        Err(err) => {
            debug!(error = %err, "viewer request rejected");
            vec![ViewerEvent::error(err.code(), err.to_string(), Some(request_type))]
        }
    }
}

fn dispatch(
    request: ViewerRequest,
    attachment: &mut Attachment,
    coordinator: &LifecycleCoordinator,
) -> Result<Vec<ViewerEvent>> {
    let registry = coordinator.registry();
    match request {
        ViewerRequest::Subscribe { connection_id } => {
            let opened = coordinator.connect(&attachment.viewer_id, &connection_id)?;
            if opened {
                // status events follow through the broadcaster
                Ok(Vec::new())
            } else {
                Ok(current_status(coordinator, &connection_id).into_iter().collect())
            }
        }
        ViewerRequest::Unsubscribe { connection_id } => {
            let _ = coordinator.disconnect(&attachment.viewer_id, &connection_id);
            Ok(Vec::new())
        }
        ViewerRequest::GetMessages {
            connection_id,
            topic,
            limit,
        } => {
            let store = coordinator.store();
            if store.connection(&connection_id)?.is_none() {
                return Err(StoreError::connection_not_found(connection_id.as_str()).into());
            }
            let messages = store
                .recent_messages(&connection_id, &topic, limit)?
                .iter()
                .map(BatchEntry::from)
                .collect();
            Ok(vec![ViewerEvent::MessagesBatch {
                connection_id,
                topic,
                messages,
            }])
        }
        ViewerRequest::Ping => {
            registry.mark_alive(&attachment.viewer_id);
            Ok(vec![ViewerEvent::Pong])
        }
        ViewerRequest::Pong => {
            registry.mark_alive(&attachment.viewer_id);
            Ok(Vec::new())
        }
        ViewerRequest::Register { prior_token } => {
            if let Some(prior) = prior_token {
                if let Some(moved) = coordinator.reattach(attachment, &prior) {
                    // the registry already announced the new identity
                    *attachment = moved;
                    return Ok(Vec::new());
                }
                debug!(prior = %prior, "prior token not registered, keeping current identity");
            }
            Ok(vec![ViewerEvent::viewer_connected(
                &attachment.viewer_id,
                attachment.attachment,
            )])
        }
        ViewerRequest::Cleanup { token } => {
            if !registry.contains(&token) {
                return Err(RelayError::viewer_not_found(token.as_str()));
            }
            let released = coordinator.cleanup(&token, &attachment.viewer_id);
            debug!(token = %token, released = released.len(), "viewer cleanup");
            Ok(Vec::new())
        }
    }
}

/// Status of an already-open broker session, for a viewer that just bound to it.
fn current_status(coordinator: &LifecycleCoordinator, connection_id: &ConnectionId) -> Option<ViewerEvent> {
    let snapshot = coordinator.manager().snapshot(connection_id)?;
    let status = match snapshot.state {
        SessionState::Connecting => ConnectionStatus::Connecting,
        SessionState::Connected => ConnectionStatus::Connected,
        SessionState::Error => ConnectionStatus::Error,
        SessionState::Idle | SessionState::Closed => ConnectionStatus::Disconnected,
    };
    let message = (status == ConnectionStatus::Error)
        .then_some(snapshot.last_error)
        .flatten();
    Some(ViewerEvent::connection_status(connection_id, status, message))
}

/// Best-effort `type` of a frame that failed to parse as a request.
fn request_type_hint(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("type")?
        .as_str()
        .map(str::to_string)
}
