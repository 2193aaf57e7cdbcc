//! End-to-end integration tests using a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_broker::test_utils::FakeTransport;
use relay_broker::{SessionState, Transport};
use relay_core::{ConnectionId, QualityLevel, ReconnectPolicy, ViewerId};
use relay_server::config::ServerConfig;
use relay_server::server::RelayServer;
use relay_store::{ConfigStore, ConnectionRecord, JsonFileStore, TopicRecord};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Relay {
    server: RelayServer,
    addr: SocketAddr,
    store: Arc<JsonFileStore>,
    transport: Arc<FakeTransport>,
    sensors: ConnectionId,
}

impl Relay {
    fn http(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn viewer(&self, token: Option<&str>) -> WsStream {
        let url = match token {
            Some(token) => format!("ws://{}/ws?token={token}", self.addr),
            None => format!("ws://{}/ws", self.addr),
        };
        let (ws, _) = timeout(TIMEOUT, connect_async(url))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        ws
    }

    /// Wait until the broker session reports connected.
    async fn wait_connected(&self) {
        let manager = Arc::clone(self.server.manager());
        let id = self.sensors.clone();
        wait_for(move || {
            manager
                .snapshot(&id)
                .is_some_and(|s| s.state == SessionState::Connected)
        })
        .await;
    }

    async fn wait_bindings(&self, count: usize) {
        let registry = Arc::clone(self.server.registry());
        let id = self.sensors.clone();
        wait_for(move || registry.binding_count(&id) == count).await;
    }
}

/// Boot a relay on an ephemeral port with one stored connection whose only
/// topic is `sensors/#`.
async fn boot_relay() -> Relay {
    let store = Arc::new(JsonFileStore::in_memory());
    let record = store
        .upsert_connection(ConnectionRecord::new("sensors", "localhost", 1883))
        .unwrap();
    let _ = store
        .upsert_topic(TopicRecord::new(
            record.id.clone(),
            "sensors/#",
            QualityLevel::AtMostOnce,
        ))
        .unwrap();

    let transport = Arc::new(FakeTransport::new());
    let server = RelayServer::new(
        ServerConfig::default(),
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::clone(&transport) as Arc<dyn Transport>,
        ReconnectPolicy::default(),
    );
    let addr = server.listen().await.unwrap();
    Relay {
        server,
        addr,
        store,
        transport,
        sensors: record.id,
    }
}

async fn send(ws: &mut WsStream, value: &Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next JSON event, skipping non-text frames.
async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read events until one satisfies `pred`.
async fn read_until(ws: &mut WsStream, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let event = next_event(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn read_until_type(ws: &mut WsStream, kind: &str) -> Value {
    read_until(ws, |e| e["type"] == kind).await
}

/// Whether a `message` event arrives within `window`.
async fn message_within(ws: &mut WsStream, window: Duration) -> Option<Value> {
    timeout(window, read_until_type(ws, "message")).await.ok()
}

async fn wait_for(cond: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn viewer_identity(ws: &mut WsStream) -> Value {
    read_until(ws, |e| e["type"] == "status" && e["scope"] == "viewer").await
}

#[tokio::test]
async fn viewer_receives_identity_on_connect() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let status = viewer_identity(&mut ws).await;
    assert_eq!(status["state"], "connected");
    assert!(!status["id"].as_str().unwrap().is_empty());
    assert!(status["wsClientId"].as_str().unwrap().starts_with("ws-"));
    relay.server.shutdown().await;
}

#[tokio::test]
async fn sensors_message_reaches_every_viewer_once() {
    let relay = boot_relay().await;
    let mut a = relay.viewer(None).await;
    let mut b = relay.viewer(None).await;
    let _ = viewer_identity(&mut a).await;
    let _ = viewer_identity(&mut b).await;

    let subscribe = json!({"type": "subscribe", "connectionId": relay.sensors.as_str()});
    send(&mut a, &subscribe).await;
    send(&mut b, &subscribe).await;
    relay.wait_bindings(2).await;
    relay.wait_connected().await;
    assert_eq!(relay.transport.open_count(&relay.sensors), 1);

    relay
        .transport
        .publish(&relay.sensors, "sensors/temp", b"21.5")
        .await;

    for ws in [&mut a, &mut b] {
        let msg = read_until_type(ws, "message").await;
        assert_eq!(msg["connectionId"], relay.sensors.as_str());
        assert_eq!(msg["topic"], "sensors/temp");
        assert_eq!(msg["payload"], "21.5");
        assert_eq!(msg["patterns"], json!(["sensors/#"]));
        assert!(message_within(ws, Duration::from_millis(200)).await.is_none());
    }
    relay.server.shutdown().await;
}

#[tokio::test]
async fn repeated_subscribe_opens_once() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;

    let subscribe = json!({"type": "subscribe", "connectionId": relay.sensors.as_str()});
    send(&mut ws, &subscribe).await;
    relay.wait_connected().await;
    send(&mut ws, &subscribe).await;

    let status = read_until(&mut ws, |e| {
        e["type"] == "status" && e["scope"] == "connection" && e["state"] == "connected"
    })
    .await;
    assert_eq!(status["id"], relay.sensors.as_str());
    assert_eq!(relay.transport.open_count(&relay.sensors), 1);
    assert_eq!(relay.server.registry().binding_count(&relay.sensors), 1);
    relay.server.shutdown().await;
}

#[tokio::test]
async fn last_unsubscribe_closes_broker_session() {
    let relay = boot_relay().await;
    let mut a = relay.viewer(None).await;
    let mut b = relay.viewer(None).await;
    let _ = viewer_identity(&mut a).await;
    let _ = viewer_identity(&mut b).await;

    let subscribe = json!({"type": "subscribe", "connectionId": relay.sensors.as_str()});
    send(&mut a, &subscribe).await;
    send(&mut b, &subscribe).await;
    relay.wait_bindings(2).await;
    relay.wait_connected().await;

    let unsubscribe = json!({"type": "unsubscribe", "connectionId": relay.sensors.as_str()});
    send(&mut a, &unsubscribe).await;
    relay.wait_bindings(1).await;
    assert_eq!(relay.transport.disconnect_count(&relay.sensors), 0);

    send(&mut b, &unsubscribe).await;
    relay.wait_bindings(0).await;
    let transport = Arc::clone(&relay.transport);
    let id = relay.sensors.clone();
    wait_for(move || transport.disconnect_count(&id) == 1).await;

    let status = read_until(&mut b, |e| {
        e["type"] == "status" && e["scope"] == "connection" && e["state"] == "disconnected"
    })
    .await;
    assert_eq!(status["id"], relay.sensors.as_str());
    relay.server.shutdown().await;
}

#[tokio::test]
async fn closing_the_socket_releases_the_session() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;
    send(&mut ws, &json!({"type": "subscribe", "connectionId": relay.sensors.as_str()})).await;
    relay.wait_connected().await;

    ws.close(None).await.unwrap();
    drop(ws);

    let transport = Arc::clone(&relay.transport);
    let id = relay.sensors.clone();
    wait_for(move || transport.disconnect_count(&id) == 1).await;
    let registry = Arc::clone(relay.server.registry());
    wait_for(move || registry.is_empty()).await;
    relay.server.shutdown().await;
}

#[tokio::test]
async fn pause_via_rest_suppresses_messages() {
    let relay = boot_relay().await;
    let client = reqwest::Client::new();
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;
    send(&mut ws, &json!({"type": "subscribe", "connectionId": relay.sensors.as_str()})).await;
    relay.wait_connected().await;

    let resp = client
        .post(relay.http(&format!("/api/connections/{}/pause", relay.sensors)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    relay.transport.publish(&relay.sensors, "sensors/a", b"1").await;
    assert!(message_within(&mut ws, Duration::from_millis(300)).await.is_none());

    let resp = client
        .post(relay.http(&format!("/api/connections/{}/resume", relay.sensors)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    relay.transport.publish(&relay.sensors, "sensors/a", b"2").await;
    let msg = read_until_type(&mut ws, "message").await;
    assert_eq!(msg["payload"], "2");

    let snapshot = relay.server.manager().snapshot(&relay.sensors).unwrap();
    assert_eq!(snapshot.messages_suppressed, 1);
    relay.server.shutdown().await;
}

#[tokio::test]
async fn token_reattach_keeps_bindings() {
    let relay = boot_relay().await;
    let mut first = relay.viewer(None).await;
    let identity = viewer_identity(&mut first).await;
    let token = identity["id"].as_str().unwrap().to_string();
    send(&mut first, &json!({"type": "subscribe", "connectionId": relay.sensors.as_str()})).await;
    relay.wait_bindings(1).await;
    relay.wait_connected().await;

    let mut second = relay.viewer(Some(&token)).await;
    let status = viewer_identity(&mut second).await;
    assert_eq!(status["id"], token.as_str());

    // The displaced socket goes away without unwinding the identity.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.server.registry().contains(&ViewerId::from(token.as_str())));
    assert_eq!(relay.server.registry().binding_count(&relay.sensors), 1);
    assert_eq!(relay.transport.disconnect_count(&relay.sensors), 0);

    relay
        .transport
        .publish(&relay.sensors, "sensors/door", b"open")
        .await;
    let msg = read_until_type(&mut second, "message").await;
    assert_eq!(msg["payload"], "open");
    relay.server.shutdown().await;
}

#[tokio::test]
async fn malformed_request_gets_error_event() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;
    ws.send(Message::text("not json")).await.unwrap();
    let err = read_until_type(&mut ws, "error").await;
    assert_eq!(err["code"], "INVALID_REQUEST");

    send(&mut ws, &json!({"type": "subscribe", "connectionId": "nope"})).await;
    let err = read_until_type(&mut ws, "error").await;
    assert_eq!(err["code"], "NOT_FOUND");
    assert_eq!(err["requestType"], "subscribe");
    relay.server.shutdown().await;
}

#[tokio::test]
async fn get_messages_returns_batch() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;
    send(
        &mut ws,
        &json!({"type": "getMessages", "connectionId": relay.sensors.as_str(), "topic": "sensors/a"}),
    )
    .await;
    let batch = read_until_type(&mut ws, "messagesBatch").await;
    assert_eq!(batch["connectionId"], relay.sensors.as_str());
    assert_eq!(batch["topic"], "sensors/a");
    assert!(batch["messages"].as_array().unwrap().is_empty());
    relay.server.shutdown().await;
}

#[tokio::test]
async fn ping_request_gets_pong() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;
    send(&mut ws, &json!({"type": "ping"})).await;
    let _ = read_until_type(&mut ws, "pong").await;
    relay.server.shutdown().await;
}

#[tokio::test]
async fn rest_connection_and_topic_crud() {
    let relay = boot_relay().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(relay.http("/api/connections"))
        .json(&json!({"name": "edge", "host": "edge.local", "protocol": "mqtts", "password": "s3cret"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["port"], 8883);
    assert!(created.get("password").is_none());
    let id = created["id"].as_str().unwrap().to_string();

    let resp = client
        .post(relay.http(&format!("/api/connections/{id}/topics")))
        .json(&json!({"pattern": "plant/+/temp", "qos": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let topics: Value = client
        .get(relay.http(&format!("/api/connections/{id}/topics")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(topics.as_array().unwrap().len(), 1);
    assert_eq!(topics[0]["pattern"], "plant/+/temp");

    let all: Value = client
        .get(relay.http("/api/connections"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.as_array().unwrap().len(), 2);

    let resp = client
        .delete(relay.http(&format!("/api/connections/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client
        .get(relay.http(&format!("/api/connections/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(relay.store.topics(&ConnectionId::from(id.as_str())).unwrap().is_empty());
    relay.server.shutdown().await;
}

#[tokio::test]
async fn health_reports_viewers_and_sessions() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;
    send(&mut ws, &json!({"type": "subscribe", "connectionId": relay.sensors.as_str()})).await;
    relay.wait_connected().await;

    let health: Value = reqwest::get(relay.http("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["viewers"], 1);
    assert_eq!(health["broker_sessions"], 1);
    assert_eq!(health["connected_brokers"], 1);
    relay.server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_viewer_sockets() {
    let relay = boot_relay().await;
    let mut ws = relay.viewer(None).await;
    let _ = viewer_identity(&mut ws).await;
    send(&mut ws, &json!({"type": "subscribe", "connectionId": relay.sensors.as_str()})).await;
    relay.wait_connected().await;

    relay.server.shutdown().await;
    assert_eq!(relay.transport.disconnect_count(&relay.sensors), 1);

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn rest_changes_persist_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connections.json");
    let store = Arc::new(JsonFileStore::open(path.clone()).unwrap());
    let server = RelayServer::new(
        ServerConfig::default(),
        store as Arc<dyn ConfigStore>,
        Arc::new(FakeTransport::new()) as Arc<dyn Transport>,
        ReconnectPolicy::default(),
    );
    let addr = server.listen().await.unwrap();

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/connections"))
        .json(&json!({"name": "plant", "host": "plant.local", "password": "s3cret"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    server.shutdown().await;

    let reopened = JsonFileStore::open(path).unwrap();
    let records = reopened.connections().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].host, "plant.local");
    assert_eq!(records[0].password.as_deref(), Some("s3cret"));
}
