//! MQTT transport over `rumqttc`.
//!
//! Each opened link gets a driver task that polls the `rumqttc` event loop,
//! translates packets into [`TransportEvent`]s and applies the
//! [`ReconnectPolicy`] between failed polls. The driver stops when the handle
//! asks it to, when the policy is exhausted, or when nobody listens to its
//! events anymore.

use std::time::Duration;

use relay_core::{BrokerEndpoint, ConnectionId, Protocol, QualityLevel, ReconnectPolicy};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport as WireTransport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::errors::{BrokerError, Result};
use crate::transport::{Transport, TransportEvent, TransportHandle, TransportSession};

/// How long a requested disconnect may take to flush before the link is dropped.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

/// [`Transport`] backed by `rumqttc`.
#[derive(Clone, Debug)]
pub struct MqttTransport {
    capacity: usize,
}

impl MqttTransport {
    /// `capacity` bounds both the client request queue and the event stream.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Transport for MqttTransport {
    fn open(
        &self,
        connection_id: &ConnectionId,
        endpoint: &BrokerEndpoint,
        policy: &ReconnectPolicy,
    ) -> Result<TransportSession> {
        let options = mqtt_options(endpoint)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.capacity);

        let mut network = eventloop.network_options();
        let _ = network.set_connection_timeout(policy.connect_timeout().as_secs().max(1));
        let _ = eventloop.set_network_options(network);

        let (tx, rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();

        let span = info_span!("mqtt_link", connection_id = %connection_id, url = %endpoint.url());
        let _ = tokio::spawn(
            drive(client.clone(), eventloop, tx, policy.clone(), cancel.clone()).instrument(span),
        );

        Ok(TransportSession {
            handle: Box::new(MqttHandle { client, cancel }),
            events: rx,
        })
    }
}

fn mqtt_options(endpoint: &BrokerEndpoint) -> Result<MqttOptions> {
    if endpoint.host.is_empty() {
        return Err(BrokerError::Transport("broker host is empty".into()));
    }
    let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
    let _ = options
        .set_keep_alive(Duration::from_secs(u64::from(endpoint.keepalive_secs)))
        .set_clean_session(endpoint.clean_start);
    if let Some(username) = &endpoint.username {
        let _ = options.set_credentials(username, endpoint.password.clone().unwrap_or_default());
    }
    if endpoint.protocol == Protocol::Mqtts {
        let _ = options.set_transport(WireTransport::tls_with_default_config());
    }
    Ok(options)
}

struct MqttHandle {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl TransportHandle for MqttHandle {
    fn subscribe(&self, pattern: &str, qos: QualityLevel) -> Result<()> {
        self.client
            .try_subscribe(pattern, to_wire_qos(qos))
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.client
            .try_unsubscribe(pattern)
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    fn disconnect(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MqttHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    client: AsyncClient,
    mut eventloop: EventLoop,
    tx: mpsc::Sender<TransportEvent>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;

    loop {
        let polled = tokio::select! {
            () = cancel.cancelled() => {
                flush_disconnect(&client, &mut eventloop).await;
                break;
            }
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                info!("broker link established");
                TransportEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
                qos: from_wire_qos(publish.qos),
                retained: publish.retain,
            },
            Ok(_) => continue,
            Err(err) => {
                failures += 1;
                let (code, message) = describe_error(&err);
                warn!(attempt = failures, code = ?code, error = %message, "broker link failed");
                if tx.send(TransportEvent::Error { code, message }).await.is_err() {
                    return;
                }
                if policy.is_exhausted(failures) {
                    warn!(attempts = failures, "reconnect attempts exhausted, giving up");
                    break;
                }
                let delay = policy.delay_for(failures);
                debug!(?delay, "waiting before reconnect");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            debug!("event receiver dropped, stopping link");
            return;
        }
    }

    let _ = tx.send(TransportEvent::Closed).await;
}

/// Send DISCONNECT and poll until it has gone out, bounded by [`DISCONNECT_FLUSH`].
async fn flush_disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.try_disconnect().is_err() {
        return;
    }
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("disconnect flush timed out");
    }
}

fn describe_error(err: &ConnectionError) -> (Option<u8>, String) {
    match err {
        ConnectionError::ConnectionRefused(code) => (Some(return_code(code)), err.to_string()),
        other => (None, other.to_string()),
    }
}

fn return_code(code: &ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

fn to_wire_qos(qos: QualityLevel) -> QoS {
    match qos {
        QualityLevel::AtMostOnce => QoS::AtMostOnce,
        QualityLevel::AtLeastOnce => QoS::AtLeastOnce,
        QualityLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_wire_qos(qos: QoS) -> QualityLevel {
    match qos {
        QoS::AtMostOnce => QualityLevel::AtMostOnce,
        QoS::AtLeastOnce => QualityLevel::AtLeastOnce,
        QoS::ExactlyOnce => QualityLevel::ExactlyOnce,
    }
}
