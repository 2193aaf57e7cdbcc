//! # relay-agent
//!
//! Relay server binary: loads settings, opens the configuration store and
//! starts the HTTP/WebSocket server.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_broker::{MqttTransport, Transport};
use relay_server::config::ServerConfig;
use relay_server::server::RelayServer;
use relay_settings::RelaySettings;
use relay_store::{ConfigStore, JsonFileStore};

/// Broker relay server.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", about = "Relays MQTT broker traffic to WebSocket viewers")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Configuration store file (overrides settings).
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn server_config(&self, settings: &RelaySettings) -> ServerConfig {
        let mut config = ServerConfig::from_settings(&settings.server);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }

    fn store_path(&self, settings: &RelaySettings) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| relay_settings::store_path(settings))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(relay_settings::settings_path);
    let settings = relay_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    relay_core::logging::init_subscriber(
        &settings.logging.level,
        args.log_json || settings.logging.json,
    );

    let store_path = args.store_path(&settings);
    ensure_parent_dir(&store_path)?;
    let store = JsonFileStore::open(store_path.clone())
        .with_context(|| format!("Failed to open store: {}", store_path.display()))?;
    let store: Arc<dyn ConfigStore> = Arc::new(store);

    let transport: Arc<dyn Transport> = Arc::new(MqttTransport::new(settings.broker.event_capacity));
    let config = args.server_config(&settings);
    let mut server = RelayServer::new(config, store, transport, settings.broker.reconnect.clone());

    match relay_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(err) => tracing::warn!(error = %err, "metrics recorder not installed"),
    }

    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        store = %store_path.display(),
        "relay listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
