//! Periodic viewer heartbeat sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::LifecycleCoordinator;

/// Run heartbeat rounds every `interval` until `cancel` fires.
///
/// Each round pings every viewer channel with a `ping` event; viewers that
/// have left `max_missed` consecutive pings unanswered, or whose channel is
/// closed, are closed and their exclusive broker sessions released.
pub async fn run_heartbeat(
    coordinator: Arc<LifecycleCoordinator>,
    interval: Duration,
    max_missed: u32,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dead = coordinator.sweep_heartbeats(max_missed);
                if !dead.is_empty() {
                    debug!(closed = dead.len(), "heartbeat round closed viewers");
                }
            }
            () = cancel.cancelled() => {
                info!("heartbeat stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_broker::BrokerSessionManager;
    use relay_broker::test_utils::FakeTransport;
    use relay_core::ReconnectPolicy;
    use relay_store::JsonFileStore;
    use tokio::sync::mpsc;

    use crate::registry::ViewerRegistry;

    fn coordinator() -> Arc<LifecycleCoordinator> {
        let (manager, _events) =
            BrokerSessionManager::new(Arc::new(FakeTransport::new()), ReconnectPolicy::default());
        Arc::new(LifecycleCoordinator::new(
            Arc::new(ViewerRegistry::new()),
            manager,
            Arc::new(JsonFileStore::in_memory()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn silent_viewer_is_closed() {
        let coordinator = coordinator();
        let (tx, _rx) = mpsc::channel(64);
        let viewer = coordinator.registry().open(tx, None).viewer_id;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&coordinator),
            Duration::from_secs(30),
            2,
            cancel.clone(),
        ));

        time::sleep(Duration::from_secs(65)).await;
        assert!(coordinator.registry().contains(&viewer));
        time::sleep(Duration::from_secs(30)).await;
        assert!(!coordinator.registry().contains(&viewer));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn answering_viewer_survives() {
        let coordinator = coordinator();
        let (tx, mut rx) = mpsc::channel(64);
        let viewer = coordinator.registry().open(tx, None).viewer_id;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&coordinator),
            Duration::from_secs(30),
            2,
            cancel.clone(),
        ));

        for _ in 0..6 {
            time::sleep(Duration::from_secs(31)).await;
            while rx.try_recv().is_ok() {}
            coordinator.registry().mark_alive(&viewer);
        }
        assert!(coordinator.registry().contains(&viewer));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_cancelled() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            coordinator(),
            Duration::from_secs(1),
            2,
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
