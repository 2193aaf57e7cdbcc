//! REST management API.
//!
//! Connection and topic records live in the configuration store; changes
//! to topics of a session the manager already knows are pushed to it so a
//! live link follows without a reconnect. Passwords are never returned.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use chrono::Utc;
use relay_broker::{BrokerError, SessionSnapshot};
use relay_core::{ConnectionId, Protocol, QualityLevel, SubscriptionId};
use relay_store::{ConnectionRecord, StoreError, TopicRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{RelayError, Result};
use crate::registry::ViewerSnapshot;
use crate::server::AppState;

/// Routes mounted under `/api`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/connections", get(list_connections).post(create_connection))
        .route(
            "/connections/{id}",
            get(get_connection)
                .put(update_connection)
                .delete(delete_connection),
        )
        .route("/connections/{id}/connect", post(connect_session))
        .route("/connections/{id}/disconnect", post(disconnect_session))
        .route("/connections/{id}/pause", post(pause_session))
        .route("/connections/{id}/resume", post(resume_session))
        .route("/connections/{id}/topics", get(list_topics).post(create_topic))
        .route("/topics/{id}", put(update_topic).delete(delete_topic))
        .route("/topics/{id}/activate", post(activate_topic))
        .route("/topics/{id}/deactivate", post(deactivate_topic))
        .route("/sessions", get(list_sessions))
}

/// Body of `POST /connections` and `PUT /connections/{id}`.
///
/// On update, absent fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInput {
    /// Display name.
    pub name: Option<String>,
    /// Broker host.
    pub host: Option<String>,
    /// Broker port; defaults to the protocol's port on create.
    pub port: Option<u16>,
    /// Transport protocol.
    pub protocol: Option<Protocol>,
    /// User name.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Client identifier.
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds.
    pub keepalive_secs: Option<u16>,
    /// Clean-start flag.
    pub clean_start: Option<bool>,
}

impl ConnectionInput {
    fn apply(self, record: &mut ConnectionRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(host) = self.host {
            record.host = host;
        }
        if let Some(protocol) = self.protocol {
            record.protocol = protocol;
        }
        if let Some(port) = self.port {
            record.port = port;
        }
        if let Some(username) = self.username {
            record.username = Some(username).filter(|u| !u.is_empty());
        }
        if let Some(password) = self.password {
            record.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(client_id) = self.client_id {
            record.client_id = Some(client_id).filter(|c| !c.is_empty());
        }
        if let Some(keepalive) = self.keepalive_secs {
            record.keepalive_secs = keepalive;
        }
        if let Some(clean_start) = self.clean_start {
            record.clean_start = clean_start;
        }
    }
}

/// Body of `POST /connections/{id}/topics` and `PUT /topics/{id}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInput {
    /// Subscription pattern.
    pub pattern: Option<String>,
    /// Delivery quality level.
    pub qos: Option<QualityLevel>,
    /// Whether the subscription is active.
    pub active: Option<bool>,
}

/// A connection record together with its live session, if any.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    /// Stored record, password removed.
    #[serde(flatten)]
    pub record: ConnectionRecord,
    /// Live session state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSnapshot>,
}

/// Body of `GET /sessions`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsView {
    /// Broker sessions known to the manager.
    pub brokers: Vec<SessionSnapshot>,
    /// Registered viewers.
    pub viewers: Vec<ViewerSnapshot>,
}

fn view(state: &AppState, record: &ConnectionRecord) -> ConnectionView {
    ConnectionView {
        record: record.redacted(),
        session: state.coordinator.manager().snapshot(&record.id),
    }
}

fn require_connection(state: &AppState, id: &ConnectionId) -> Result<ConnectionRecord> {
    state
        .coordinator
        .store()
        .connection(id)?
        .ok_or_else(|| StoreError::connection_not_found(id.as_str()).into())
}

fn require_topic(state: &AppState, id: &SubscriptionId) -> Result<TopicRecord> {
    state
        .coordinator
        .store()
        .topic(id)?
        .ok_or_else(|| StoreError::topic_not_found(id.as_str()).into())
}

/// Push a stored topic to the manager if it holds the session.
fn sync_topic(state: &AppState, topic: &TopicRecord) -> Result<()> {
    match state
        .coordinator
        .manager()
        .add_subscription(&topic.connection_id, topic.subscription())
    {
        Ok(()) | Err(BrokerError::UnknownSession(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// GET /api/connections
async fn list_connections(State(state): State<AppState>) -> Result<Json<Vec<ConnectionView>>> {
    let records = state.coordinator.store().connections()?;
    Ok(Json(records.iter().map(|r| view(&state, r)).collect()))
}

/// POST /api/connections
async fn create_connection(
    State(state): State<AppState>,
    Json(input): Json<ConnectionInput>,
) -> Result<impl IntoResponse> {
    let host = input
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RelayError::InvalidRequest("host is required".into()))?;
    let protocol = input.protocol.unwrap_or_default();
    let name = input.name.clone().unwrap_or_else(|| host.clone());
    let mut record = ConnectionRecord::new(name, host, protocol.default_port());
    input.apply(&mut record);

    let record = state.coordinator.store().upsert_connection(record)?;
    info!(connection_id = %record.id, url = %record.endpoint().url(), "connection created");
    Ok((StatusCode::CREATED, Json(view(&state, &record))))
}

/// GET /api/connections/{id}
async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<ConnectionView>> {
    let record = require_connection(&state, &id)?;
    Ok(Json(view(&state, &record)))
}

/// PUT /api/connections/{id}
///
/// The new endpoint applies the next time the session is opened.
async fn update_connection(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Json(input): Json<ConnectionInput>,
) -> Result<Json<ConnectionView>> {
    let mut record = require_connection(&state, &id)?;
    input.apply(&mut record);
    record.updated_at = Utc::now();
    let record = state.coordinator.store().upsert_connection(record)?;
    info!(connection_id = %id, "connection updated");
    Ok(Json(view(&state, &record)))
}

/// DELETE /api/connections/{id}
async fn delete_connection(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<StatusCode> {
    if !state.coordinator.store().delete_connection(&id)? {
        return Err(StoreError::connection_not_found(id.as_str()).into());
    }
    state.coordinator.remove_connection(&id);
    info!(connection_id = %id, "connection deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/connections/{id}/connect
async fn connect_session(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<ConnectionView>> {
    let record = require_connection(&state, &id)?;
    let opened = state.coordinator.admin_connect(&id)?;
    debug!(connection_id = %id, opened, "connect requested");
    Ok(Json(view(&state, &record)))
}

/// POST /api/connections/{id}/disconnect
async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<ConnectionView>> {
    let record = require_connection(&state, &id)?;
    let requested = state.coordinator.admin_disconnect(&id);
    debug!(connection_id = %id, requested, "disconnect requested");
    Ok(Json(view(&state, &record)))
}

fn set_paused(state: &AppState, id: &ConnectionId, paused: bool) -> Result<Json<ConnectionView>> {
    let record = require_connection(state, id)?;
    state.coordinator.manager().set_paused(id, paused)?;
    Ok(Json(view(state, &record)))
}

/// POST /api/connections/{id}/pause
async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<ConnectionView>> {
    set_paused(&state, &id, true)
}

/// POST /api/connections/{id}/resume
async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<ConnectionView>> {
    set_paused(&state, &id, false)
}

/// GET /api/connections/{id}/topics
async fn list_topics(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<Vec<TopicRecord>>> {
    let _ = require_connection(&state, &id)?;
    Ok(Json(state.coordinator.store().topics(&id)?))
}

/// POST /api/connections/{id}/topics
async fn create_topic(
    State(state): State<AppState>,
    Path(id): Path<ConnectionId>,
    Json(input): Json<TopicInput>,
) -> Result<impl IntoResponse> {
    let pattern = input
        .pattern
        .ok_or_else(|| RelayError::InvalidRequest("pattern is required".into()))?;
    let mut record = TopicRecord::new(id, pattern, input.qos.unwrap_or_default());
    if let Some(active) = input.active {
        record.active = active;
    }
    let record = state.coordinator.store().upsert_topic(record)?;
    sync_topic(&state, &record)?;
    info!(topic_id = %record.id, connection_id = %record.connection_id, pattern = %record.pattern, "topic created");
    Ok((StatusCode::CREATED, Json(record)))
}

/// PUT /api/topics/{id}
async fn update_topic(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    Json(input): Json<TopicInput>,
) -> Result<Json<TopicRecord>> {
    let mut record = require_topic(&state, &id)?;
    if let Some(pattern) = input.pattern {
        record.pattern = pattern;
    }
    if let Some(qos) = input.qos {
        record.qos = qos;
    }
    if let Some(active) = input.active {
        record.active = active;
    }
    let record = state.coordinator.store().upsert_topic(record)?;
    sync_topic(&state, &record)?;
    Ok(Json(record))
}

/// DELETE /api/topics/{id}
async fn delete_topic(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<StatusCode> {
    let Some(removed) = state.coordinator.store().delete_topic(&id)? else {
        return Err(StoreError::topic_not_found(id.as_str()).into());
    };
    let _ = state.coordinator.manager().remove_subscription(&removed.id);
    info!(topic_id = %id, "topic deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn set_topic_active(state: &AppState, id: &SubscriptionId, active: bool) -> Result<Json<TopicRecord>> {
    let record = state.coordinator.store().set_topic_active(id, active)?;
    let held = state
        .coordinator
        .manager()
        .set_subscription_active(id, active);
    debug!(topic_id = %id, active, held, "topic active flag changed");
    Ok(Json(record))
}

/// POST /api/topics/{id}/activate
async fn activate_topic(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<Json<TopicRecord>> {
    set_topic_active(&state, &id, true)
}

/// POST /api/topics/{id}/deactivate
async fn deactivate_topic(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<Json<TopicRecord>> {
    set_topic_active(&state, &id, false)
}

/// GET /api/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<SessionsView> {
    Json(SessionsView {
        brokers: state.coordinator.manager().sessions(),
        viewers: state.coordinator.registry().snapshot(),
    })
}
