//! Command router
//!
//! The only part of the daemon that speaks the wire format. Inbound text from
//! either transport is decoded into [`Inbound`] and dispatched to the session
//! registry, the handshake, the transport coordinator or the agent. Outbound
//! events go back through the coordinator, which picks the channel.
//!
//! Nothing reaches the peer before the handshake confirms it, and terminal
//! output is forwarded only for sessions in the current active set.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use tether_core::error::{HandshakeError, TransportError};
use tether_core::SessionRetention;
use tether_protocol::{
    Command, Event, HandshakeMessage, Inbound, RelayControl, SessionId, SignalingMessage,
};

use crate::agent::{AgentEvent, AgentLoop};
use crate::handshake::{Handshake, HandshakeStep};
use crate::pty::{ScreenSnapshot, SessionEvent, SessionRegistry};
use crate::transport::{LinkEvent, RelayEvent, TransportCoordinator};

/// Dispatches inbound messages and daemon events for one daemon instance
pub struct Router {
    registry: Arc<Mutex<SessionRegistry>>,
    coordinator: TransportCoordinator,
    handshake: Handshake,
    agent: AgentLoop,
    registration: RelayControl,
    retention: SessionRetention,
    /// Highest output revision already delivered in a `process:screen`
    replayed: HashMap<SessionId, u64>,
}

impl Router {
    pub fn new(
        registry: Arc<Mutex<SessionRegistry>>,
        coordinator: TransportCoordinator,
        handshake: Handshake,
        agent: AgentLoop,
        registration: RelayControl,
        retention: SessionRetention,
    ) -> Self {
        Self {
            registry,
            coordinator,
            handshake,
            agent,
            registration,
            retention,
            replayed: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Mutex<SessionRegistry>> {
        &self.registry
    }

    pub fn coordinator(&self) -> &TransportCoordinator {
        &self.coordinator
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn agent(&self) -> &AgentLoop {
        &self.agent
    }

    /// Relay connection lifecycle and inbound relay frames
    pub async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => self.register(),
            RelayEvent::Message(text) => self.handle_text(&text).await,
            RelayEvent::Disconnected => {
                tracing::warn!("Relay connection lost; sessions kept");
            }
        }
    }

    /// Direct link events; data channel messages are routed like relay frames
    pub async fn on_link_event(&mut self, event: LinkEvent) {
        if let Some(text) = self.coordinator.on_link_event(event).await {
            self.handle_text(&text).await;
        }
    }

    /// Output and exits from session reader threads
    pub async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Output { id, data, revision } => {
                if !self.coordinator.is_trusted() {
                    return;
                }
                if !self.registry.lock().await.is_active(&id) {
                    return;
                }
                if self.replayed.get(&id).is_some_and(|seen| revision <= *seen) {
                    return;
                }
                self.coordinator
                    .send_event(&Event::TerminalOutput { id, data });
            }

            SessionEvent::Exited { id, generation } => {
                let reaped = self.registry.lock().await.reap(&id, generation);
                match reaped {
                    Ok(exit_code) => {
                        self.replayed.remove(&id);
                        self.send(&Event::ProcessExited { id, exit_code });
                    }
                    Err(e) => {
                        tracing::debug!(session = %id, error = %e, "Exit of a removed session");
                    }
                }
            }
        }
    }

    pub fn on_agent_event(&self, event: AgentEvent) {
        self.send(&event.to_event());
    }

    /// Decode and dispatch one inbound frame
    pub async fn handle_text(&mut self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable message");
                self.send(&Event::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        match inbound {
            Inbound::Relay(control) => self.on_relay_control(control).await,
            Inbound::Handshake(message) => self.on_handshake(message).await,
            Inbound::Signaling(message) => self.on_signaling(message).await,
            Inbound::Command(command) => {
                if !self.coordinator.is_trusted() {
                    tracing::warn!(
                        session = ?command.session_id(),
                        "Dropping command from unverified peer"
                    );
                    return;
                }
                self.on_command(command).await;
            }
            Inbound::Unsupported { namespace, action } => {
                tracing::debug!(%namespace, %action, "Unsupported namespace");
                self.send(&Event::Error {
                    message: format!("{} namespace is not supported", namespace),
                });
            }
        }
    }

    /// Terminate sessions, cancel the agent and close both transports
    pub async fn shutdown(&mut self) {
        self.agent.cancel();
        self.registry.lock().await.cleanup();
        self.handshake.reset();
        self.replayed.clear();
        self.coordinator.shutdown().await;
    }

    fn register(&self) {
        let result = self
            .registration
            .to_envelope()
            .map_err(TransportError::from)
            .and_then(|env| self.coordinator.send_relay(&env.action, &env.payload));
        match result {
            Ok(()) => tracing::info!("Registered with relay"),
            Err(e) => tracing::warn!(error = %e, "Failed to send registration"),
        }
    }

    async fn on_relay_control(&mut self, control: RelayControl) {
        match control {
            RelayControl::Registered { device_id } => {
                tracing::info!(device_id = ?device_id, "Relay accepted registration");
            }

            RelayControl::Paired {
                peer_id,
                peer_public_key,
            } => {
                tracing::info!(peer = %peer_id, "Relay paired a peer");
                self.coordinator.on_paired().await;
                self.replayed.clear();
                match self
                    .handshake
                    .on_paired(&peer_id, peer_public_key.as_deref())
                {
                    Ok(Some(initiate)) => self.send_handshake(&initiate),
                    Ok(None) => tracing::debug!(peer = %peer_id, "Waiting for peer to initiate"),
                    Err(e) => {
                        tracing::warn!(peer = %peer_id, error = %e, "Pairing aborted");
                        self.send_handshake(&HandshakeMessage::Error {
                            peer_id: Some(peer_id),
                            error: e.to_string(),
                        });
                    }
                }
            }

            RelayControl::PeerDisconnected { peer_id } => {
                tracing::info!(peer = ?peer_id, "Peer left the relay; sessions kept");
            }

            RelayControl::PeerLost { peer_id } => {
                tracing::info!(peer = ?peer_id, retention = ?self.retention, "Peer lost");
                self.coordinator.on_peer_fully_disconnected().await;
                self.handshake.reset();
                self.agent.cancel();
                self.replayed.clear();
                match self.retention {
                    SessionRetention::Keep => {
                        let count = self.registry.lock().await.len();
                        tracing::info!(count, "Keeping sessions for reconnection");
                    }
                    SessionRetention::Terminate => self.registry.lock().await.cleanup(),
                }
            }

            RelayControl::Error { message } => {
                tracing::warn!(%message, "Relay reported an error");
            }

            RelayControl::Register { .. } => {
                tracing::debug!("Ignoring echoed registration");
            }
        }
    }

    async fn on_handshake(&mut self, message: HandshakeMessage) {
        let peer_hint = message
            .peer_id()
            .or_else(|| self.handshake.peer_id())
            .map(str::to_string);

        match self.handshake.on_message(message) {
            Ok(HandshakeStep::Reply(reply)) => self.send_handshake(&reply),

            Ok(HandshakeStep::Confirmed {
                peer_id,
                secret,
                reply,
            }) => {
                tracing::info!(peer = %peer_id, "Peer verified");
                self.coordinator.set_shared_secret(secret);
                if let Some(reply) = reply {
                    self.send_handshake(&reply);
                }
                self.replayed.clear();
                self.send_sync().await;
                self.replay_active().await;
                if let Err(e) = self.coordinator.begin_negotiation().await {
                    tracing::warn!(error = %e, "Direct negotiation not started; using relay");
                }
            }

            Ok(HandshakeStep::Ignored) => {}

            Err(HandshakeError::Rejected(reason)) => {
                tracing::warn!(peer = ?peer_hint, %reason, "Peer rejected the handshake");
            }

            Err(e) => {
                tracing::warn!(peer = ?peer_hint, error = %e, "Handshake failed");
                self.send_handshake(&HandshakeMessage::Error {
                    peer_id: peer_hint,
                    error: e.to_string(),
                });
            }
        }

        if !self.handshake.is_confirmed() {
            self.coordinator.clear_shared_secret();
        }
    }

    async fn on_signaling(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Answer { sdp } => self.coordinator.on_remote_answer(sdp).await,
            SignalingMessage::IceCandidate(candidate) => {
                self.coordinator.on_remote_candidate(candidate).await
            }
            SignalingMessage::Offer { .. } => {
                tracing::warn!("Ignoring offer; this side always offers");
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::CreateProcess {
                id,
                cols,
                rows,
                name,
            } => {
                let created = {
                    let mut registry = self.registry.lock().await;
                    registry.create(id.clone(), cols, rows, name).map(|handle| {
                        let cwd = registry.working_directory(&handle.id);
                        (handle, cwd)
                    })
                };
                match created {
                    Ok((handle, cwd)) => self.send(&Event::ProcessCreated {
                        id: handle.id,
                        name: handle.name,
                        created_at: handle.created_at,
                        working_directory: cwd.map(|path| path.display().to_string()),
                    }),
                    Err(e) => {
                        tracing::warn!(session = %id, error = %e, "Could not create session");
                        self.send(&Event::ProcessError {
                            id,
                            error: e.to_string(),
                        });
                    }
                }
            }

            Command::TerminateProcess { id } => {
                if self.registry.lock().await.terminate(&id) {
                    self.replayed.remove(&id);
                    self.send(&Event::ProcessTerminated { id });
                }
            }

            Command::SwitchProcesses { active_ids } => {
                let snapshots = self.registry.lock().await.set_active(&active_ids);
                self.replayed.retain(|id, _| active_ids.contains(id));
                for snapshot in snapshots {
                    self.send_screen(snapshot);
                }
            }

            Command::RenameProcess { id, name } => {
                if self.registry.lock().await.rename(&id, name.clone()) {
                    self.send(&Event::ProcessRenamed { id, name });
                } else {
                    tracing::debug!(session = %id, "Rename of unknown session");
                }
            }

            Command::Input { id, data } => {
                self.registry.lock().await.write(&id, data.as_bytes());
            }

            Command::Resize { id, cols, rows } => {
                let mut registry = self.registry.lock().await;
                match id {
                    Some(id) => {
                        registry.resize(&id, cols, rows);
                    }
                    None => registry.resize_all(cols, rows),
                }
            }

            Command::QuickActions { id, actions } => {
                let mut registry = self.registry.lock().await;
                for action in &actions {
                    if !registry.write(&id, action.to_input().as_bytes()) {
                        break;
                    }
                }
            }

            Command::AiPrompt { prompt, id } => {
                // The agent locks the registry itself; no guard may be held here
                if let Err(e) = self.agent.handle_prompt(prompt, id).await {
                    tracing::info!(error = %e, "Prompt rejected");
                    self.send(&Event::AiError {
                        error: e.to_string(),
                        raw: e.raw().map(str::to_string),
                    });
                }
            }

            Command::AiCancel {} => {
                if !self.agent.cancel() {
                    tracing::debug!("Cancel with no prompt running");
                }
            }

            Command::RequestSync {} => self.send_sync().await,
        }
    }

    async fn send_sync(&self) {
        let (processes, active_ids) = {
            let registry = self.registry.lock().await;
            (registry.list_for_sync(), registry.active_ids())
        };
        tracing::debug!(
            sessions = processes.len(),
            active = active_ids.len(),
            "Sending session sync"
        );
        self.send(&Event::ProcessesSync {
            processes,
            active_ids,
        });
    }

    /// Backlog of sessions that were already active before this pairing
    async fn replay_active(&mut self) {
        let snapshots: Vec<ScreenSnapshot> = {
            let registry = self.registry.lock().await;
            registry
                .active_ids()
                .iter()
                .filter_map(|id| registry.snapshot(id))
                .collect()
        };
        for snapshot in snapshots {
            self.send_screen(snapshot);
        }
    }

    fn send_screen(&mut self, snapshot: ScreenSnapshot) {
        self.replayed.insert(snapshot.id.clone(), snapshot.revision);
        self.send(&Event::ProcessScreen {
            id: snapshot.id,
            data: snapshot.data,
        });
    }

    /// Send to the verified peer; dropped before the handshake completes
    fn send(&self, event: &Event) {
        if !self.coordinator.is_trusted() {
            tracing::trace!(?event, "No verified peer; event dropped");
            return;
        }
        self.coordinator.send_event(event);
    }

    fn send_handshake(&self, message: &HandshakeMessage) {
        let result = message
            .to_envelope()
            .map_err(TransportError::from)
            .and_then(|env| self.coordinator.send_relay(&env.action, &env.payload));
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to send handshake message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{derive_shared_secret, sign, KeyPair};
    use crate::pty::memory::MemoryBackend;
    use crate::transport::memory::{MemoryConnector, RecordingTransport};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tether_core::config::{AgentConfig, SessionConfig, TransportConfig};
    use tether_core::error::AgentError;
    use tether_core::traits::{CompletionRequest, CompletionService, Transport};
    use tether_protocol::Envelope;
    use tokio_util::sync::CancellationToken;

    struct NoCompletion;

    #[async_trait]
    impl CompletionService for NoCompletion {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, AgentError> {
            Err(AgentError::Completion("offline".to_string()))
        }
    }

    struct Fixture {
        router: Router,
        relay: Arc<RecordingTransport>,
        backend: MemoryBackend,
        phone: KeyPair,
    }

    fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let (registry, _sessions) =
            SessionRegistry::new(Arc::new(backend.clone()), SessionConfig::default());
        let registry = Arc::new(Mutex::new(registry));
        let relay = Arc::new(RecordingTransport::new("relay", true));
        let (coordinator, _links) = TransportCoordinator::new(
            Arc::new(MemoryConnector::new()),
            relay.clone(),
            &TransportConfig::default(),
        );
        let (agent, _agent_events) = AgentLoop::new(
            Arc::new(NoCompletion),
            registry.clone(),
            AgentConfig::default(),
            CancellationToken::new(),
        );
        let registration = RelayControl::Register {
            device_id: "desk".to_string(),
            device_name: "workstation".to_string(),
            public_key: "KEY".to_string(),
            token: None,
        };
        let router = Router::new(
            registry,
            coordinator,
            Handshake::new(Some(Arc::new(KeyPair::generate()))),
            agent,
            registration,
            SessionRetention::Keep,
        );
        Fixture {
            router,
            relay,
            backend,
            phone: KeyPair::generate(),
        }
    }

    fn frame(action: &str, payload: Value) -> String {
        Envelope::new(action, payload).to_json()
    }

    impl Fixture {
        async fn pair(&mut self) {
            let paired = frame(
                "relay:paired",
                json!({"peerId": "phone", "peerPublicKey": self.phone.public_key_base64()}),
            );
            self.router.handle_text(&paired).await;

            let initiate = self.relay.payloads("handshake:initiate").pop().unwrap();
            let daemon_key = initiate["peerPublicKey"].as_str().unwrap();
            let challenge = initiate["challenge"].as_str().unwrap();
            let secret = derive_shared_secret(&self.phone, daemon_key).unwrap();
            let response = frame(
                "handshake:response",
                json!({"peerId": "phone", "signature": sign(challenge, &secret).unwrap()}),
            );
            self.router.handle_text(&response).await;
        }
    }

    #[tokio::test]
    async fn test_registers_on_connect() {
        let mut f = fixture();
        f.router.on_relay_event(RelayEvent::Connected).await;
        let payload = f.relay.payloads("relay:register").pop().unwrap();
        assert_eq!(payload["deviceId"], "desk");
        assert_eq!(payload["publicKey"], "KEY");
    }

    #[tokio::test]
    async fn test_commands_ignored_before_handshake() {
        let mut f = fixture();
        f.router
            .handle_text(&frame("process:create", json!({"id": "a"})))
            .await;

        assert_eq!(f.backend.spawned(), 0);
        assert!(f.relay.payloads("process:created").is_empty());
    }

    #[tokio::test]
    async fn test_handshake_confirms_and_syncs() {
        let mut f = fixture();
        f.pair().await;

        assert!(f.router.handshake().is_confirmed());
        assert!(f.router.coordinator().is_trusted());
        let actions = f.relay.actions();
        assert!(actions.contains(&"handshake:confirmed".to_string()));
        assert!(actions.contains(&"processes:sync".to_string()));
    }

    #[tokio::test]
    async fn test_bad_signature_reports_error() {
        let mut f = fixture();
        f.router
            .handle_text(&frame(
                "relay:paired",
                json!({"peerId": "phone", "peerPublicKey": f.phone.public_key_base64()}),
            ))
            .await;
        f.router
            .handle_text(&frame(
                "handshake:response",
                json!({"peerId": "phone", "signature": "00"}),
            ))
            .await;

        assert!(!f.router.coordinator().is_trusted());
        let error = f.relay.payloads("handshake:error").pop().unwrap();
        assert_eq!(error["peerId"], "phone");
        assert!(f.relay.payloads("processes:sync").is_empty());
    }

    #[tokio::test]
    async fn test_stray_initiate_cannot_take_over_pairing() {
        let mut f = fixture();
        f.pair().await;

        let intruder = KeyPair::generate();
        f.router
            .handle_text(&frame(
                "handshake:initiate",
                json!({
                    "peerId": "intruder",
                    "peerPublicKey": intruder.public_key_base64(),
                    "challenge": "00ff",
                }),
            ))
            .await;
        f.router
            .handle_text(&frame("handshake:confirmed", json!({})))
            .await;

        assert_eq!(
            f.router.handshake().state(),
            &crate::handshake::HandshakeState::Confirmed {
                peer_id: "phone".to_string()
            }
        );
        assert!(f.router.coordinator().is_trusted());
        assert!(f.relay.payloads("handshake:response").is_empty());
        assert!(f.relay.payloads("handshake:error").is_empty());

        // The original phone keeps its session rights
        f.router
            .handle_text(&frame("process:create", json!({"id": "a"})))
            .await;
        assert_eq!(f.backend.spawned(), 1);
    }

    #[tokio::test]
    async fn test_response_from_other_peer_is_rejected() {
        let mut f = fixture();
        f.router
            .handle_text(&frame(
                "relay:paired",
                json!({"peerId": "phone", "peerPublicKey": f.phone.public_key_base64()}),
            ))
            .await;
        f.router
            .handle_text(&frame(
                "handshake:response",
                json!({"peerId": "intruder", "signature": "00"}),
            ))
            .await;

        let error = f.relay.payloads("handshake:error").pop().unwrap();
        assert_eq!(error["peerId"], "intruder");
        assert!(matches!(
            f.router.handshake().state(),
            crate::handshake::HandshakeState::AwaitingResponse { .. }
        ));
        assert!(!f.router.coordinator().is_trusted());
    }

    #[tokio::test]
    async fn test_create_and_spawn_failure() {
        let mut f = fixture();
        f.pair().await;

        f.router
            .handle_text(&frame("process:create", json!({"id": "a", "name": "build"})))
            .await;
        let created = f.relay.payloads("process:created").pop().unwrap();
        assert_eq!(created["id"], "a");
        assert_eq!(created["name"], "build");
        #[cfg(target_os = "linux")]
        assert_eq!(
            created["workingDirectory"],
            std::env::current_dir().unwrap().display().to_string()
        );

        f.router
            .handle_text(&frame("process:create", json!({"id": "a"})))
            .await;
        let error = f.relay.payloads("process:error").pop().unwrap();
        assert_eq!(error["id"], "a");
    }

    #[tokio::test]
    async fn test_quick_actions_written_in_order() {
        let mut f = fixture();
        f.pair().await;
        f.router
            .handle_text(&frame("process:create", json!({"id": "a"})))
            .await;

        f.router
            .handle_text(&frame(
                "terminal:actions",
                json!({"id": "a", "actions": [
                    {"type": "text", "value": "git "},
                    {"type": "command", "value": "status", "label": "Status"}
                ]}),
            ))
            .await;

        assert_eq!(f.backend.last().unwrap().input_string(), "git status\r");
    }

    #[tokio::test]
    async fn test_code_namespace_unsupported() {
        let mut f = fixture();
        f.pair().await;
        f.router
            .handle_text(r#"{"namespace":"code","action":"file:read","payload":{"path":"/"}}"#)
            .await;

        let error = f.relay.payloads("error").pop().unwrap();
        assert!(error["message"].as_str().unwrap().contains("code"));
    }

    #[tokio::test]
    async fn test_prompt_without_session_reports_error() {
        let mut f = fixture();
        f.pair().await;
        f.router
            .handle_text(&frame("ai:prompt", json!({"prompt": "list files"})))
            .await;

        let error = f.relay.payloads("ai:error").pop().unwrap();
        assert!(error["error"].is_string());
        assert!(!f.router.agent().is_busy());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let mut f = fixture();
        f.pair().await;
        f.router
            .handle_text(&frame("process:create", json!({"id": "a"})))
            .await;

        f.router.shutdown().await;
        assert!(f.backend.last().unwrap().is_killed());
        assert!(f.router.registry().lock().await.is_empty());
        assert!(!f.router.coordinator().is_trusted());
        assert!(!f.relay.is_open());
    }
}
