//! Graceful shutdown coordination via `CancellationToken`.
//!
//! The relay shuts down in order: stop probing viewers, ask every broker
//! session to close and wait for them up to the grace period, close all
//! viewer channels, then cancel the remaining tasks and abort whatever is
//! still running once the grace period is spent.

use std::time::Duration;

use relay_broker::BrokerSessionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often [`wait_for_brokers`] re-checks the open session count.
const BROKER_POLL: Duration = Duration::from_millis(25);

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    heartbeat: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let token = CancellationToken::new();
        let heartbeat = token.child_token();
        Self { token, heartbeat }
    }

    /// Token cancelled when the whole server stops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled first, stopping the heartbeat sweep.
    pub fn heartbeat_token(&self) -> CancellationToken {
        self.heartbeat.clone()
    }

    /// Stop the heartbeat sweep only.
    pub fn stop_heartbeat(&self) {
        self.heartbeat.cancel();
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the shutdown token and wait up to `timeout` for `handles`,
    /// aborting any that are still running afterwards.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Duration) {
        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask every broker session to close and wait until none is open, or until
/// `grace` elapses. Returns whether every session closed in time.
pub async fn wait_for_brokers(manager: &BrokerSessionManager, grace: Duration) -> bool {
    let asked = manager.disconnect_all();
    info!(sessions = asked.len(), "closing broker sessions");

    let closed = tokio::time::timeout(grace, async {
        while manager.open_count() > 0 {
            tokio::time::sleep(BROKER_POLL).await;
        }
    })
    .await
    .is_ok();

    if !closed {
        warn!(
            still_open = manager.open_count(),
            "broker sessions did not close within grace period"
        );
    }
    closed
}
