//! Daemon context
//!
//! Everything the daemon needs is built once at startup and handed to the
//! components that use it. Tests build the same context with in-memory
//! backends and transports.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tether_core::config::DaemonConfig;
use tether_core::traits::{CompletionService, Transport};
use tether_core::DeviceId;
use tether_protocol::RelayControl;

use crate::agent::{AgentEvent, AgentLoop};
use crate::handshake::{Handshake, KeyPair};
use crate::pty::{PtyBackend, SessionEvent, SessionRegistry};
use crate::router::Router;
use crate::transport::{LinkEvent, PeerConnector, RelayEvent, TransportCoordinator};

/// Capacity of the relay event channel
pub const RELAY_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared handles for one daemon instance
#[derive(Clone)]
pub struct DaemonContext {
    pub config: DaemonConfig,
    pub device_id: DeviceId,
    pub key_pair: Arc<KeyPair>,
    pub backend: Arc<dyn PtyBackend>,
    pub connector: Arc<dyn PeerConnector>,
    pub relay: Arc<dyn Transport>,
    pub completion: Arc<dyn CompletionService>,
    pub shutdown: CancellationToken,
}

/// Receivers the event loop selects over
pub struct DaemonChannels {
    pub relay: mpsc::Receiver<RelayEvent>,
    pub links: mpsc::UnboundedReceiver<LinkEvent>,
    pub sessions: mpsc::Receiver<SessionEvent>,
    pub agent: mpsc::Receiver<AgentEvent>,
}

impl DaemonContext {
    /// The `relay:register` message sent on every relay (re)connect
    pub fn registration(&self) -> RelayControl {
        RelayControl::Register {
            device_id: self.device_id.to_string(),
            device_name: self.config.device_name(),
            public_key: self.key_pair.public_key_base64(),
            token: self.config.relay_token.clone(),
        }
    }

    /// Wire up the registry, coordinator, handshake and agent into a router
    pub fn build(&self, relay_events: mpsc::Receiver<RelayEvent>) -> (Router, DaemonChannels) {
        let (registry, sessions) =
            SessionRegistry::new(Arc::clone(&self.backend), self.config.session.clone());
        let registry = Arc::new(Mutex::new(registry));

        let (coordinator, links) = TransportCoordinator::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.relay),
            &self.config.transport,
        );

        let (agent, agent_events) = AgentLoop::new(
            Arc::clone(&self.completion),
            registry.clone(),
            self.config.agent.clone(),
            self.shutdown.clone(),
        );

        let router = Router::new(
            registry,
            coordinator,
            Handshake::new(Some(Arc::clone(&self.key_pair))),
            agent,
            self.registration(),
            self.config.session.retention,
        );

        let channels = DaemonChannels {
            relay: relay_events,
            links,
            sessions,
            agent: agent_events,
        };
        (router, channels)
    }
}
