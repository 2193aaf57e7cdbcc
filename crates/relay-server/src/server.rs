//! `RelayServer`: Axum HTTP + WebSocket server and its background tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use relay_broker::{BrokerEvent, BrokerSessionManager, SessionState, Transport};
use relay_core::ReconnectPolicy;
use relay_store::ConfigStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api;
use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::coordinator::LifecycleCoordinator;
use crate::errors::{RelayError, Result};
use crate::health::{self, HealthResponse};
use crate::heartbeat::run_heartbeat;
use crate::registry::ViewerRegistry;
use crate::router::run_event_router;
use crate::shutdown::{ShutdownCoordinator, wait_for_brokers};
use crate::websocket;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Viewer/broker binding lifecycle; also reaches the registry, the
    /// session manager and the store.
    pub coordinator: Arc<LifecycleCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<ViewerRegistry>,
    manager: Arc<BrokerSessionManager>,
    coordinator: Arc<LifecycleCoordinator>,
    broadcaster: Broadcaster,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
    events: Mutex<Option<mpsc::UnboundedReceiver<BrokerEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    /// Wire up a server over `store`, opening broker links through `transport`.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn ConfigStore>,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> Self {
        let registry = Arc::new(ViewerRegistry::new());
        let (manager, events) = BrokerSessionManager::new(transport, policy);
        let coordinator = Arc::new(LifecycleCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            store,
        ));
        Self {
            config: Arc::new(config),
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            manager,
            coordinator,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            coordinator: Arc::clone(&self.coordinator),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(websocket::ws_handler))
            .nest("/api", api::routes())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the listener and start the event router, the heartbeat sweep
    /// and the HTTP server. Returns the bound address.
    ///
    /// Can only be called once per server.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let events = self.events.lock().take().ok_or_else(|| {
            RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "relay server already started",
            ))
        })?;

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let router_task = tokio::spawn(run_event_router(
            events,
            self.broadcaster.clone(),
            Arc::clone(&self.coordinator),
            self.shutdown.token(),
        ));
        let heartbeat_task = tokio::spawn(run_heartbeat(
            Arc::clone(&self.coordinator),
            self.config.heartbeat_interval(),
            self.config.max_missed_heartbeats,
            self.shutdown.heartbeat_token(),
        ));

        let app = self.router();
        let token = self.shutdown.token();
        let serve_task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %err, "http server failed");
            }
        });

        self.tasks
            .lock()
            .extend([router_task, heartbeat_task, serve_task]);
        info!(addr = %local_addr, "relay server started");
        Ok(local_addr)
    }

    /// Stop the server: heartbeat first, then broker sessions (waiting up
    /// to the grace period), then viewer channels, then every task.
    pub async fn shutdown(&self) {
        let grace = self.config.shutdown_grace();
        info!("relay server shutting down");
        self.shutdown.stop_heartbeat();
        let _ = wait_for_brokers(&self.manager, grace).await;
        let closed = self.registry.close_all();
        info!(viewers = closed.len(), "viewer channels closed");
        let tasks = std::mem::take(&mut *self.tasks.lock());
        self.shutdown.graceful_shutdown(tasks, grace).await;
        info!("relay server stopped");
    }

    /// Get the viewer registry.
    pub fn registry(&self) -> &Arc<ViewerRegistry> {
        &self.registry
    }

    /// Get the broker session manager.
    pub fn manager(&self) -> &Arc<BrokerSessionManager> {
        &self.manager
    }

    /// Get the lifecycle coordinator.
    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    /// Get the shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = state.coordinator.manager();
    let connected = manager
        .sessions()
        .iter()
        .filter(|s| s.state == SessionState::Connected)
        .count();
    Json(health::health_check(
        state.start_time,
        state.coordinator.registry().len(),
        manager.open_count(),
        connected,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use relay_broker::test_utils::FakeTransport;
    use relay_core::ConnectionId;
    use relay_store::{ConnectionRecord, JsonFileStore, TopicRecord};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    struct Fixture {
        server: RelayServer,
        store: Arc<JsonFileStore>,
        transport: Arc<FakeTransport>,
    }

    fn make_server() -> Fixture {
        let store = Arc::new(JsonFileStore::in_memory());
        let transport = Arc::new(FakeTransport::new());
        let server = RelayServer::new(
            ServerConfig::default(),
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            ReconnectPolicy::default(),
        );
        Fixture {
            server,
            store,
            transport,
        }
    }

    fn seed(store: &JsonFileStore) -> ConnectionRecord {
        let mut record = ConnectionRecord::new("local", "localhost", 1883);
        record.password = Some("hunter2".into());
        let record = store.upsert_connection(record).unwrap();
        let _ = store
            .upsert_topic(TopicRecord::new(
                record.id.clone(),
                "sensors/#",
                relay_core::QualityLevel::AtMostOnce,
            ))
            .unwrap();
        record
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[test]
    fn server_with_default_config() {
        let f = make_server();
        assert_eq!(f.server.config().host, "127.0.0.1");
        assert_eq!(f.server.config().port, 0);
        assert!(f.server.registry().is_empty());
        assert!(!f.server.shutdown_coordinator().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let f = make_server();
        let (status, body) = call(f.server.router(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["viewers"], 0);
        assert_eq!(body["broker_sessions"], 0);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let f = make_server();
        let (status, _) = call(f.server.router(), Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let f = make_server();
        let (status, _) = call(f.server.router(), Method::GET, "/nonexistent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let f = make_server();
        let (status, _) = call(f.server.router(), Method::GET, "/ws", None).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn create_and_list_connections_redacts_password() {
        let f = make_server();
        let (status, created) = call(
            f.server.router(),
            Method::POST,
            "/api/connections",
            Some(json!({"name": "local", "host": "localhost", "password": "hunter2"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["host"], "localhost");
        assert_eq!(created["port"], 1883);
        assert!(created.get("password").is_none_or(Value::is_null));

        let (status, list) = call(f.server.router(), Method::GET, "/api/connections", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert!(!list.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn create_connection_requires_host() {
        let f = make_server();
        let (status, body) = call(
            f.server.router(),
            Method::POST,
            "/api/connections",
            Some(json!({"name": "nowhere"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn unknown_connection_is_404() {
        let f = make_server();
        let (status, body) = call(f.server.router(), Method::GET, "/api/connections/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn update_connection_keeps_absent_fields() {
        let f = make_server();
        let record = seed(&f.store);
        let uri = format!("/api/connections/{}", record.id);
        let (status, body) = call(f.server.router(), Method::PUT, &uri, Some(json!({"name": "renamed"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "renamed");
        assert_eq!(body["host"], "localhost");
        let stored = f.store.connection(&record.id).unwrap().unwrap();
        assert_eq!(stored.password.as_deref(), Some("hunter2"));
    }

    #[tokio::test]
    async fn connect_and_pause_through_api() {
        let f = make_server();
        let record = seed(&f.store);
        let uri = format!("/api/connections/{}/connect", record.id);
        let (status, body) = call(f.server.router(), Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["session"].is_object());
        assert_eq!(f.transport.open_count(&record.id), 1);

        let uri = format!("/api/connections/{}/pause", record.id);
        let (status, body) = call(f.server.router(), Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["paused"], true);

        let uri = format!("/api/connections/{}/resume", record.id);
        let (_, body) = call(f.server.router(), Method::POST, &uri, None).await;
        assert_eq!(body["session"]["paused"], false);
    }

    #[tokio::test]
    async fn pause_without_session_is_404() {
        let f = make_server();
        let record = seed(&f.store);
        let uri = format!("/api/connections/{}/pause", record.id);
        let (status, _) = call(f.server.router(), Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn topic_crud() {
        let f = make_server();
        let record = seed(&f.store);
        let uri = format!("/api/connections/{}/topics", record.id);
        let (status, created) = call(
            f.server.router(),
            Method::POST,
            &uri,
            Some(json!({"pattern": "alerts/+", "qos": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["pattern"], "alerts/+");
        assert_eq!(created["qos"], 1);

        let (_, list) = call(f.server.router(), Method::GET, &uri, None).await;
        assert_eq!(list.as_array().unwrap().len(), 2);

        let topic_id = created["id"].as_str().unwrap().to_string();
        let (status, body) = call(
            f.server.router(),
            Method::POST,
            &format!("/api/topics/{topic_id}/deactivate"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], false);

        let (status, _) = call(f.server.router(), Method::DELETE, &format!("/api/topics/{topic_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(f.server.router(), Method::DELETE, &format!("/api/topics/{topic_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_topic_pattern_is_400() {
        let f = make_server();
        let record = seed(&f.store);
        let uri = format!("/api/connections/{}/topics", record.id);
        let (status, body) = call(f.server.router(), Method::POST, &uri, Some(json!({"pattern": "a/#/b"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PATTERN");
    }

    #[tokio::test]
    async fn topic_added_to_open_session_is_subscribed() {
        let f = make_server();
        let record = seed(&f.store);
        let _ = f.server.coordinator().admin_connect(&record.id).unwrap();
        // FakeTransport reports Connected on open; let the pump apply it.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let uri = format!("/api/connections/{}/topics", record.id);
        let (status, _) = call(f.server.router(), Method::POST, &uri, Some(json!({"pattern": "alerts/+"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let snapshot = f.server.manager().snapshot(&record.id).unwrap();
        assert!(snapshot.subscriptions.iter().any(|s| s.pattern == "alerts/+"));
    }

    #[tokio::test]
    async fn delete_connection_removes_session() {
        let f = make_server();
        let record = seed(&f.store);
        let _ = f.server.coordinator().admin_connect(&record.id).unwrap();
        let uri = format!("/api/connections/{}", record.id);
        let (status, _) = call(f.server.router(), Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!f.server.manager().contains(&record.id));
        assert!(f.store.connection(&record.id).unwrap().is_none());

        let (status, _) = call(f.server.router(), Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_lists_brokers_and_viewers() {
        let f = make_server();
        let record = seed(&f.store);
        let _ = f.server.coordinator().admin_connect(&record.id).unwrap();
        let (status, body) = call(f.server.router(), Method::GET, "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        let brokers = body["brokers"].as_array().unwrap();
        assert_eq!(brokers.len(), 1);
        assert_eq!(brokers[0]["connectionId"], record.id.as_str());
        assert!(body["viewers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let f = make_server();
        let addr = f.server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(f.server.listen().await.is_err());
        f.server.shutdown().await;
        assert!(f.server.shutdown_coordinator().is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_closes_broker_sessions() {
        let f = make_server();
        let record = seed(&f.store);
        let _ = f.server.listen().await.unwrap();
        let id: ConnectionId = record.id.clone();
        let _ = f.server.coordinator().admin_connect(&id).unwrap();
        f.server.shutdown().await;
        assert_eq!(f.transport.disconnect_count(&id), 1);
        assert_eq!(f.server.manager().open_count(), 0);
    }
}
