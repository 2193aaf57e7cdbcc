//! In-process transport for tests.
//!
//! [`FakeTransport`] records every request made through its handles and
//! lets a test push [`TransportEvent`]s into a link as if a broker had sent
//! them. By default a link reports `Connected` as soon as it is opened and
//! `Closed` as soon as a disconnect is requested.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_core::{BrokerEndpoint, ConnectionId, QualityLevel, ReconnectPolicy};
use tokio::sync::mpsc;

use crate::errors::{BrokerError, Result};
use crate::transport::{Transport, TransportEvent, TransportHandle, TransportSession};

const LINK_CAPACITY: usize = 256;

#[derive(Default)]
struct LinkLog {
    opens: usize,
    disconnects: usize,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    sender: Option<mpsc::Sender<TransportEvent>>,
}

#[derive(Default)]
struct FakeState {
    links: HashMap<ConnectionId, LinkLog>,
    manual_connect: bool,
    refuse_opens: bool,
    fail_subscribes: bool,
}

/// Scriptable [`Transport`] that never touches the network.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    /// Transport whose links connect immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, opened links stay in `connecting` until a test emits
    /// [`TransportEvent::Connected`].
    pub fn manual_connect(&self, manual: bool) {
        self.state.lock().manual_connect = manual;
    }

    /// Make subsequent `open` calls fail.
    pub fn refuse_opens(&self, refuse: bool) {
        self.state.lock().refuse_opens = refuse;
    }

    /// Make subscribe requests fail.
    pub fn fail_subscribes(&self, fail: bool) {
        self.state.lock().fail_subscribes = fail;
    }

    /// How many links were opened for `id`.
    pub fn open_count(&self, id: &ConnectionId) -> usize {
        self.state.lock().links.get(id).map_or(0, |l| l.opens)
    }

    /// How many disconnects were requested for `id`.
    pub fn disconnect_count(&self, id: &ConnectionId) -> usize {
        self.state.lock().links.get(id).map_or(0, |l| l.disconnects)
    }

    /// Patterns subscribed on `id`, in request order.
    pub fn subscribed(&self, id: &ConnectionId) -> Vec<String> {
        self.state
            .lock()
            .links
            .get(id)
            .map(|l| l.subscribed.clone())
            .unwrap_or_default()
    }

    /// Patterns unsubscribed on `id`, in request order.
    pub fn unsubscribed(&self, id: &ConnectionId) -> Vec<String> {
        self.state
            .lock()
            .links
            .get(id)
            .map(|l| l.unsubscribed.clone())
            .unwrap_or_default()
    }

    /// Push an event into the current link for `id`.
    ///
    /// Silently does nothing if no link is open.
    pub async fn emit(&self, id: &ConnectionId, event: TransportEvent) {
        let sender = self.state.lock().links.get(id).and_then(|l| l.sender.clone());
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Deliver a QoS 0, non-retained publish on `id`.
    pub async fn publish(&self, id: &ConnectionId, topic: &str, payload: &[u8]) {
        self.emit(
            id,
            TransportEvent::Message {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos: QualityLevel::AtMostOnce,
                retained: false,
            },
        )
        .await;
    }
}

impl Transport for FakeTransport {
    fn open(
        &self,
        connection_id: &ConnectionId,
        _endpoint: &BrokerEndpoint,
        _policy: &ReconnectPolicy,
    ) -> Result<TransportSession> {
        let mut state = self.state.lock();
        if state.refuse_opens {
            return Err(BrokerError::Transport("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(LINK_CAPACITY);
        if !state.manual_connect {
            let _ = tx.try_send(TransportEvent::Connected);
        }
        let link = state.links.entry(connection_id.clone()).or_default();
        link.opens += 1;
        link.sender = Some(tx.clone());
        drop(state);

        Ok(TransportSession {
            handle: Box::new(FakeHandle {
                id: connection_id.clone(),
                state: Arc::clone(&self.state),
                tx,
            }),
            events: rx,
        })
    }
}

struct FakeHandle {
    id: ConnectionId,
    state: Arc<Mutex<FakeState>>,
    tx: mpsc::Sender<TransportEvent>,
}

impl TransportHandle for FakeHandle {
    fn subscribe(&self, pattern: &str, _qos: QualityLevel) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_subscribes {
            return Err(BrokerError::Transport("request queue full".into()));
        }
        state
            .links
            .entry(self.id.clone())
            .or_default()
            .subscribed
            .push(pattern.to_string());
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.state
            .lock()
            .links
            .entry(self.id.clone())
            .or_default()
            .unsubscribed
            .push(pattern.to_string());
        Ok(())
    }

    fn disconnect(&self) {
        self.state
            .lock()
            .links
            .entry(self.id.clone())
            .or_default()
            .disconnects += 1;
        let _ = self.tx.try_send(TransportEvent::Closed);
    }
}
