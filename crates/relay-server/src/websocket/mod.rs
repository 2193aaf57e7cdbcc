//! WebSocket gateway for viewers.
//!
//! - [`handler`]: typed request dispatch
//! - [`session`]: per-viewer session task (reader loop + writer task)

pub mod handler;
pub mod session;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use relay_core::ViewerId;
use serde::Deserialize;

use crate::server::AppState;

/// Query parameters accepted by `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Identity from an earlier channel, to re-attach to.
    #[serde(default)]
    pub token: Option<ViewerId>,
}

/// `GET /ws`: upgrade and hand the socket to a viewer session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max_size = state.config.max_message_size;
    ws.max_message_size(max_size)
        .on_upgrade(move |socket| session::run_viewer_session(socket, state, params.token))
}
