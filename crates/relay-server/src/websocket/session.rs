//! Viewer WebSocket session: one connected viewer from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::ViewerId;
use tokio::sync::mpsc;
use tracing::{Span, debug, field, info, instrument};

use super::handler::handle_message;
use crate::metrics::{
    VIEWER_CONNECTION_DURATION_SECONDS, VIEWER_CONNECTIONS_ACTIVE, VIEWER_CONNECTIONS_TOTAL,
    VIEWER_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// Run a WebSocket session for a connected viewer.
///
/// 1. Registers the channel (re-using `prior_token`'s identity if it is
///    still registered); the registry queues the viewer `status` event
/// 2. Forwards queued frames to the socket from a writer task
/// 3. Dispatches incoming text frames as viewer requests
/// 4. Treats WebSocket Ping/Pong frames as heartbeat acknowledgements
/// 5. Ends when either side closes, then unwinds the identity's bindings
///    unless another channel has since taken the identity over
#[instrument(skip_all, fields(viewer_id = field::Empty))]
pub async fn run_viewer_session(ws: WebSocket, state: AppState, prior_token: Option<ViewerId>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let coordinator = Arc::clone(&state.coordinator);
    let registry = Arc::clone(coordinator.registry());

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(state.config.channel_capacity.max(1));
    let mut attachment = registry.open(send_tx, prior_token.as_ref());
    let _ = Span::current().record("viewer_id", attachment.viewer_id.as_str());

    let started = Instant::now();
    info!(reattached = attachment.reattached, "viewer connected");
    counter!(VIEWER_CONNECTIONS_TOTAL).increment(1);
    gauge!(VIEWER_CONNECTIONS_ACTIVE).increment(1.0);

    // Outbound forwarder. Ends when the registry drops the channel.
    let mut outbound = tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            if ws_tx
                .send(Message::Text(String::from(frame.as_str()).into()))
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let inbound = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(text) => text.to_string(),
                Message::Binary(data) => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        text.to_string()
                    } else {
                        info!(len = data.len(), "received non-UTF8 binary frame");
                        continue;
                    }
                }
                Message::Close(_) => {
                    info!("viewer sent close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    registry.mark_alive(&attachment.viewer_id);
                    continue;
                }
            };

            for reply in handle_message(&text, &mut attachment, &coordinator) {
                if !registry.send(&attachment.viewer_id, &reply) {
                    info!("failed to enqueue reply (channel full or closed)");
                }
            }
        }
    };

    tokio::select! {
        () = inbound => {}
        _ = &mut outbound => debug!("viewer channel closed by registry"),
    }

    let released = coordinator.channel_closed(&attachment);
    info!(viewer_id = %attachment.viewer_id, released = released.len(), "viewer disconnected");
    counter!(VIEWER_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(VIEWER_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(VIEWER_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    outbound.abort();
}
