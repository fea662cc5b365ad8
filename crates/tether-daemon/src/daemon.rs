//! The daemon event loop

use tokio_util::sync::CancellationToken;

use crate::context::DaemonChannels;
use crate::router::Router;

/// Drive the router until `shutdown` fires, then tear everything down
pub async fn run_event_loop(
    mut router: Router,
    mut channels: DaemonChannels,
    shutdown: CancellationToken,
) {
    tracing::info!("Entering event loop");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested");
                break;
            }

            Some(event) = channels.relay.recv() => {
                router.on_relay_event(event).await;
            }

            Some(event) = channels.links.recv() => {
                router.on_link_event(event).await;
            }

            Some(event) = channels.sessions.recv() => {
                router.on_session_event(event).await;
            }

            Some(event) = channels.agent.recv() => {
                router.on_agent_event(event);
            }
        }
    }

    router.shutdown().await;
    tracing::info!("Event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use tether_core::config::DaemonConfig;
    use tether_core::error::AgentError;
    use tether_core::traits::{CompletionRequest, CompletionService, Transport};
    use tether_core::DeviceId;

    use crate::context::{DaemonContext, RELAY_EVENT_CHANNEL_CAPACITY};
    use crate::handshake::KeyPair;
    use crate::pty::memory::MemoryBackend;
    use crate::transport::memory::{MemoryConnector, RecordingTransport};
    use crate::transport::RelayEvent;

    struct Offline;

    #[async_trait]
    impl CompletionService for Offline {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, AgentError> {
            Err(AgentError::Completion("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_registers_then_shuts_down() {
        let relay = Arc::new(RecordingTransport::new("relay", true));
        let shutdown = CancellationToken::new();
        let context = DaemonContext {
            config: DaemonConfig::default(),
            device_id: DeviceId::new("desk"),
            key_pair: Arc::new(KeyPair::generate()),
            backend: Arc::new(MemoryBackend::new()),
            connector: Arc::new(MemoryConnector::new()),
            relay: relay.clone(),
            completion: Arc::new(Offline),
            shutdown: shutdown.clone(),
        };

        let (relay_tx, relay_rx) = mpsc::channel(RELAY_EVENT_CHANNEL_CAPACITY);
        let (router, channels) = context.build(relay_rx);
        let task = tokio::spawn(run_event_loop(router, channels, shutdown.clone()));

        relay_tx.send(RelayEvent::Connected).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.payloads("relay:register").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registration was not sent");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("event loop did not stop")
            .unwrap();
        assert!(!relay.is_open());
    }
}
