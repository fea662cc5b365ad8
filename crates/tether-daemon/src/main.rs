//! Tether desktop daemon
//!
//! Registers with the relay, waits for the paired phone to pass the
//! handshake, then serves shell sessions over the relay or a direct WebRTC
//! data channel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, DaemonConfig};
use tether_core::traits::CompletionService;
use tether_core::DeviceId;
use tether_daemon::agent::{AnthropicCompletion, UnconfiguredCompletion};
use tether_daemon::context::{DaemonContext, RELAY_EVENT_CHANNEL_CAPACITY};
use tether_daemon::handshake::KeyPair;
use tether_daemon::pty::{validate_shell_path, NativePtyBackend};
use tether_daemon::transport::{RelayClient, RelayTransport, WebRtcConnector};

#[derive(Parser)]
#[command(name = "tetherd")]
#[command(about = "Tether daemon - control local terminals from your phone")]
#[command(version)]
struct Args {
    /// Relay WebSocket URL
    #[arg(long)]
    relay_url: Option<String>,

    /// Name shown on the phone (defaults to hostname)
    #[arg(long)]
    device_name: Option<String>,

    /// Shell to spawn for new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tether daemon starting...");

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config: DaemonConfig = config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let device_id = match config.device_id.clone() {
        Some(id) => id,
        None => {
            let id = DeviceId::generate();
            config.device_id = Some(id.clone());
            match config::save_config(&config_path, &config) {
                Ok(()) => tracing::info!(device_id = %id, "Generated device id"),
                Err(e) => tracing::warn!("Could not persist device id to {:?}: {}", config_path, e),
            }
            id
        }
    };

    // Command-line overrides are not persisted
    if let Some(url) = args.relay_url {
        config.relay_url = url;
    }
    if let Some(name) = args.device_name {
        config.device_name = Some(name);
    }
    if let Some(shell) = args.shell {
        config.session.shell = Some(validate_shell_path(&shell).context("Invalid --shell")?);
    }

    tracing::info!(
        device_id = %device_id,
        device_name = %config.device_name(),
        relay = %config.relay_url,
        "Configuration loaded"
    );

    let completion: Arc<dyn CompletionService> = match AnthropicCompletion::from_config(&config.agent) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            tracing::warn!("AI prompts disabled: {}", e);
            Arc::new(UnconfiguredCompletion::new(e.to_string()))
        }
    };

    let shutdown = CancellationToken::new();
    let relay = Arc::new(RelayTransport::new());
    let context = DaemonContext {
        device_id,
        key_pair: Arc::new(KeyPair::generate()),
        backend: Arc::new(NativePtyBackend::new(config.session.shell.clone())),
        connector: Arc::new(WebRtcConnector::new(config.transport.ice_servers.clone())),
        relay: relay.clone(),
        completion,
        shutdown: shutdown.clone(),
        config,
    };

    let (relay_tx, relay_rx) = mpsc::channel(RELAY_EVENT_CHANNEL_CAPACITY);
    let client = RelayClient::new(
        context.config.relay_url.clone(),
        relay,
        &context.config.transport.backoff,
    );
    let relay_task = tokio::spawn(client.run(relay_tx, shutdown.clone()));

    let (router, channels) = context.build(relay_rx);

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
        ctrl_c.cancel();
    });

    tether_daemon::run_event_loop(router, channels, shutdown).await;

    if let Err(e) = relay_task.await {
        tracing::warn!("Relay task ended abnormally: {}", e);
    }
    tracing::info!("Tether daemon stopped");
    Ok(())
}
