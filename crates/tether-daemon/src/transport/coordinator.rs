//! Direct/relay transport coordination for one pairing
//!
//! The relay is always there; the direct WebRTC channel is negotiated over it
//! and preferred once open. Losing the direct channel degrades to the relay
//! without touching sessions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use tether_core::config::TransportConfig;
use tether_core::error::TransportError;
use tether_core::traits::Transport;
use tether_core::TransportPhase;
use tether_protocol::{Event, IceCandidate, SignalingMessage};

use super::peer::{DirectEvent, DirectState, LinkEvent, LinkEventSender, PeerConnector, PeerLink};
use crate::handshake::SharedSecret;

/// Snapshot of the coordinator for logs and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportState {
    pub phase: TransportPhase,
    pub direct_channel_ready: bool,
    pub pending_remote_candidates: usize,
    pub trusted: bool,
}

/// Chooses between the direct channel and the relay
pub struct TransportCoordinator {
    connector: Arc<dyn PeerConnector>,
    relay: Arc<dyn Transport>,
    gathering_timeout: Duration,
    events_tx: LinkEventSender,

    phase: TransportPhase,
    link: Option<Arc<dyn PeerLink>>,
    link_id: u64,
    direct: Option<Arc<dyn Transport>>,
    direct_channel_ready: bool,
    remote_description_set: bool,
    offer_sent: bool,
    pending_remote_candidates: Vec<IceCandidate>,
    pending_local_candidates: Vec<IceCandidate>,
    shared_secret: Option<SharedSecret>,
}

impl TransportCoordinator {
    /// Create a coordinator and the receiver for its link events
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        relay: Arc<dyn Transport>,
        config: &TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            connector,
            relay,
            gathering_timeout: config.gathering_timeout,
            events_tx,
            phase: TransportPhase::Idle,
            link: None,
            link_id: 0,
            direct: None,
            direct_channel_ready: false,
            remote_description_set: false,
            offer_sent: false,
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            shared_secret: None,
        };
        (coordinator, events_rx)
    }

    pub fn phase(&self) -> TransportPhase {
        self.phase
    }

    pub fn state(&self) -> TransportState {
        TransportState {
            phase: self.phase,
            direct_channel_ready: self.direct_channel_ready,
            pending_remote_candidates: self.pending_remote_candidates.len(),
            trusted: self.is_trusted(),
        }
    }

    /// Whether the current peer passed the handshake
    pub fn is_trusted(&self) -> bool {
        self.shared_secret.is_some() && self.phase != TransportPhase::Closed
    }

    pub fn set_shared_secret(&mut self, secret: SharedSecret) {
        self.shared_secret = Some(secret);
    }

    pub fn clear_shared_secret(&mut self) {
        self.shared_secret = None;
    }

    /// Start a fresh direct negotiation.
    ///
    /// The offer is produced in the background; it goes out over the relay
    /// when the link reports [`DirectEvent::OfferReady`].
    pub async fn begin_negotiation(&mut self) -> Result<(), TransportError> {
        if self.phase == TransportPhase::Closed {
            return Err(TransportError::Closed);
        }

        self.teardown_direct().await;
        self.link_id += 1;

        let link = match self
            .connector
            .connect(self.link_id, self.events_tx.clone())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(error = %e, "Could not create peer connection; staying on relay");
                self.phase = TransportPhase::Degraded;
                return Err(e);
            }
        };

        self.direct = Some(link.channel());
        self.link = Some(Arc::clone(&link));
        self.phase = TransportPhase::Negotiating;
        tracing::info!(link = self.link_id, "Starting direct channel negotiation");

        let events = self.events_tx.clone();
        let link_id = self.link_id;
        let gathering_timeout = self.gathering_timeout;
        tokio::spawn(async move {
            let event = match link.create_offer().await {
                Ok(offer) => {
                    let complete = tokio::time::timeout(gathering_timeout, link.gathering_complete())
                        .await
                        .is_ok();
                    if !complete {
                        tracing::debug!(link = link_id, "ICE gathering timed out; sending partial offer");
                    }
                    let sdp = link.local_description().await.unwrap_or(offer);
                    DirectEvent::OfferReady { sdp, complete }
                }
                Err(e) => DirectEvent::OfferFailed(e.to_string()),
            };
            let _ = events.send(LinkEvent {
                link: link_id,
                event,
            });
        });

        Ok(())
    }

    /// Handle an event from a peer link.
    ///
    /// Returns text received on the data channel for the router.
    pub async fn on_link_event(&mut self, event: LinkEvent) -> Option<String> {
        // Frames stranded in a dying channel are resent even if the link is gone
        if let DirectEvent::Undelivered { event, payload } = event.event {
            self.resend_over_relay(&event, &payload);
            return None;
        }

        if event.link != self.link_id || self.link.is_none() {
            tracing::trace!(link = event.link, "Ignoring event from stale link");
            return None;
        }

        match event.event {
            DirectEvent::StateChanged(state) => self.on_direct_state_change(state).await,
            DirectEvent::LocalCandidate(candidate) => {
                if self.offer_sent {
                    self.send_signal(SignalingMessage::IceCandidate(candidate));
                } else {
                    self.pending_local_candidates.push(candidate);
                }
            }
            DirectEvent::ChannelOpen => {
                self.direct_channel_ready = true;
                if self.phase == TransportPhase::Negotiating {
                    self.phase = TransportPhase::Connected;
                }
                tracing::info!("Direct data channel open");
            }
            DirectEvent::ChannelClosed => {
                self.direct_channel_ready = false;
                self.on_direct_state_change(DirectState::Closed).await;
            }
            DirectEvent::Message(text) => return Some(text),
            DirectEvent::Undelivered { .. } => {}
            DirectEvent::OfferReady { sdp, complete } => self.send_offer(sdp, complete),
            DirectEvent::OfferFailed(reason) => {
                tracing::warn!(reason = %reason, "Could not create offer");
                self.on_direct_state_change(DirectState::Failed).await;
            }
        }
        None
    }

    fn send_offer(&mut self, sdp: String, complete: bool) {
        if self.phase != TransportPhase::Negotiating {
            tracing::debug!(phase = %self.phase, "Offer ready outside negotiation; dropping");
            return;
        }

        self.send_signal(SignalingMessage::Offer { sdp });
        self.offer_sent = true;

        // A complete offer already carries every candidate gathered so far
        let gathered = std::mem::take(&mut self.pending_local_candidates);
        if !complete {
            for candidate in gathered {
                self.send_signal(SignalingMessage::IceCandidate(candidate));
            }
        }
    }

    /// Apply the peer's answer
    pub async fn on_remote_answer(&mut self, sdp: String) {
        if self.phase != TransportPhase::Negotiating {
            tracing::warn!(phase = %self.phase, "Discarding answer outside negotiation");
            return;
        }
        let Some(link) = self.link.clone() else {
            return;
        };

        if let Err(e) = link.set_remote_answer(&sdp).await {
            tracing::warn!(error = %e, "Failed to apply remote answer");
            self.on_direct_state_change(DirectState::Failed).await;
            return;
        }

        self.remote_description_set = true;
        let queued = std::mem::take(&mut self.pending_remote_candidates);
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "Applying queued remote candidates");
        }
        for candidate in &queued {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to add queued remote candidate");
            }
        }
    }

    /// Apply or queue a remote ICE candidate
    pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(link) = self.link.clone() else {
            tracing::debug!("Remote candidate without a peer link; dropping");
            return;
        };

        if !self.remote_description_set {
            self.pending_remote_candidates.push(candidate);
            return;
        }

        if let Err(e) = link.add_remote_candidate(&candidate).await {
            tracing::warn!(error = %e, "Failed to add remote candidate");
        }
    }

    /// React to the peer connection state
    pub async fn on_direct_state_change(&mut self, state: DirectState) {
        match state {
            DirectState::Connected => {
                if self.phase == TransportPhase::Negotiating {
                    self.phase = TransportPhase::Connected;
                    tracing::info!("Direct connection established");
                }
            }
            DirectState::Disconnected | DirectState::Failed | DirectState::Closed => {
                if matches!(
                    self.phase,
                    TransportPhase::Negotiating | TransportPhase::Connected
                ) {
                    tracing::warn!(state = ?state, "Direct channel lost; falling back to relay");
                    self.phase = TransportPhase::Degraded;
                }
                self.teardown_direct().await;
            }
            DirectState::New | DirectState::Connecting => {}
        }
    }

    /// Send through the direct channel, falling back to the relay.
    ///
    /// Returns whether the direct channel took the message.
    pub fn send(&self, event: &str, payload: &Value) -> bool {
        if let Some(direct) = self.open_direct() {
            match direct.send(event, payload) {
                Ok(()) => return true,
                Err(e) => {
                    tracing::debug!(error = %e, event, "Direct send failed; using relay");
                }
            }
        }

        if let Err(e) = self.relay.send(event, payload) {
            tracing::warn!(error = %e, event, "Relay send failed; message dropped");
        }
        false
    }

    fn resend_over_relay(&self, event: &str, payload: &Value) {
        if !self.is_trusted() {
            tracing::debug!(event, "Undelivered frame dropped; peer no longer trusted");
            return;
        }
        tracing::debug!(event, "Resending undelivered frame over relay");
        if let Err(e) = self.relay.send(event, payload) {
            tracing::warn!(error = %e, event, "Relay send failed; message dropped");
        }
    }

    /// Encode and [`send`](Self::send) a daemon event
    pub fn send_event(&self, event: &Event) -> bool {
        match event.into_parts() {
            Ok((action, payload)) => self.send(&action, &payload),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode event");
                false
            }
        }
    }

    /// Send over the relay only (handshake, signaling, registration)
    pub fn send_relay(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        self.relay.send(event, payload)
    }

    fn send_signal(&self, message: SignalingMessage) {
        let result = message
            .to_envelope()
            .map_err(TransportError::from)
            .and_then(|env| self.relay.send(&env.action, &env.payload));
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to send signaling message");
        }
    }

    fn open_direct(&self) -> Option<&Arc<dyn Transport>> {
        self.direct
            .as_ref()
            .filter(|direct| self.direct_channel_ready && direct.is_open())
    }

    /// The relay introduced a (possibly returning) peer
    pub async fn on_paired(&mut self) {
        self.teardown_direct().await;
        self.shared_secret = None;
        self.phase = TransportPhase::Idle;
    }

    /// The peer is gone for good
    pub async fn on_peer_fully_disconnected(&mut self) {
        self.teardown_direct().await;
        self.shared_secret = None;
        self.phase = TransportPhase::Closed;
        tracing::info!("Peer lost; transport closed");
    }

    /// Close both channels
    pub async fn shutdown(&mut self) {
        self.teardown_direct().await;
        self.shared_secret = None;
        self.phase = TransportPhase::Closed;
        self.relay.close();
    }

    async fn teardown_direct(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.direct = None;
        self.direct_channel_ready = false;
        self.remote_description_set = false;
        self.offer_sent = false;
        self.pending_remote_candidates.clear();
        self.pending_local_candidates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryConnector, MemoryLink, RecordingTransport};
    use serde_json::json;

    struct Harness {
        coordinator: TransportCoordinator,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        connector: MemoryConnector,
        relay: Arc<RecordingTransport>,
    }

    fn harness() -> Harness {
        let connector = MemoryConnector::new();
        let relay = Arc::new(RecordingTransport::new("relay", true));
        let (coordinator, events) = TransportCoordinator::new(
            Arc::new(connector.clone()),
            relay.clone(),
            &TransportConfig::default(),
        );
        Harness {
            coordinator,
            events,
            connector,
            relay,
        }
    }

    impl Harness {
        /// Feed the next link event to the coordinator
        async fn pump(&mut self) -> Option<String> {
            let event = self.events.recv().await.unwrap();
            self.coordinator.on_link_event(event).await
        }

        async fn negotiate(&mut self) -> Arc<MemoryLink> {
            self.coordinator.begin_negotiation().await.unwrap();
            self.pump().await;
            self.connector.last().unwrap()
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_offer_goes_over_relay() {
        let mut h = harness();
        let link = h.negotiate().await;

        assert_eq!(h.coordinator.phase(), TransportPhase::Negotiating);
        let offers = h.relay.payloads("webrtc:offer");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0]["sdp"], format!("v=0 memory-offer-{}", link.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_timeout_sends_partial_offer_and_trickles() {
        let mut h = harness();
        h.connector.stall_gathering(true);
        h.coordinator.begin_negotiation().await.unwrap();
        let link = h.connector.last().unwrap();

        link.emit(DirectEvent::LocalCandidate(candidate(1)));
        h.pump().await;
        assert!(h.relay.payloads("webrtc:offer").is_empty());

        // Offer arrives once the gathering timeout elapses
        h.pump().await;
        assert_eq!(h.relay.payloads("webrtc:offer").len(), 1);
        assert_eq!(h.relay.payloads("webrtc:ice-candidate").len(), 1);

        link.emit(DirectEvent::LocalCandidate(candidate(2)));
        h.pump().await;
        let trickled = h.relay.payloads("webrtc:ice-candidate");
        assert_eq!(trickled.len(), 2);
        assert_eq!(trickled[1]["candidate"], candidate(2).candidate);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_answer() {
        let mut h = harness();
        let link = h.negotiate().await;

        for n in 1..=3 {
            h.coordinator.on_remote_candidate(candidate(n)).await;
        }
        assert!(link.remote_candidates().is_empty());
        assert_eq!(h.coordinator.state().pending_remote_candidates, 3);

        h.coordinator.on_remote_answer("v=0 answer".to_string()).await;
        assert_eq!(link.remote_answer().as_deref(), Some("v=0 answer"));
        assert_eq!(
            link.remote_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
        assert_eq!(h.coordinator.state().pending_remote_candidates, 0);

        h.coordinator.on_remote_candidate(candidate(4)).await;
        assert_eq!(link.remote_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_answer_outside_negotiation_is_discarded() {
        let mut h = harness();
        h.coordinator.on_remote_answer("v=0 stray".to_string()).await;
        assert_eq!(h.coordinator.phase(), TransportPhase::Idle);

        let link = h.negotiate().await;
        link.open_channel();
        h.pump().await;
        h.pump().await;
        assert_eq!(h.coordinator.phase(), TransportPhase::Connected);

        h.coordinator.on_remote_answer("v=0 late".to_string()).await;
        assert!(link.remote_answer().is_none());
    }

    #[tokio::test]
    async fn test_send_prefers_direct_and_falls_back() {
        let mut h = harness();
        let payload = json!({"id": "a", "data": "x"});

        assert!(!h.coordinator.send("terminal:output", &payload));
        assert_eq!(h.relay.payloads("terminal:output").len(), 1);

        let link = h.negotiate().await;
        link.open_channel();
        h.pump().await;
        h.pump().await;

        assert!(h.coordinator.send("terminal:output", &payload));
        assert_eq!(link.recording().payloads("terminal:output").len(), 1);
        assert_eq!(h.relay.payloads("terminal:output").len(), 1);

        link.recording().set_failing(true);
        assert!(!h.coordinator.send("terminal:output", &payload));
        assert_eq!(h.relay.payloads("terminal:output").len(), 2);
    }

    #[tokio::test]
    async fn test_undelivered_direct_frames_go_to_relay() {
        let mut h = harness();
        h.coordinator
            .set_shared_secret(SharedSecret::from_bytes([3u8; 32]));
        let link = h.negotiate().await;
        link.open_channel();
        h.pump().await;
        h.pump().await;

        assert!(h.coordinator.send("terminal:output", &json!({"id": "a", "data": "1"})));
        assert!(h.coordinator.send("terminal:output", &json!({"id": "a", "data": "2"})));
        assert!(h.relay.payloads("terminal:output").is_empty());

        link.fail_queued_writes();
        link.drop_connection(DirectState::Failed);
        h.pump().await;
        h.pump().await;
        h.pump().await;

        let resent: Vec<Value> = h
            .relay
            .payloads("terminal:output")
            .into_iter()
            .map(|p| p["data"].clone())
            .collect();
        assert_eq!(resent, vec![json!("1"), json!("2")]);
        assert_eq!(h.coordinator.phase(), TransportPhase::Degraded);

        // Stranded frames from the torn-down link still reach the peer
        link.emit(DirectEvent::Undelivered {
            event: "terminal:output".to_string(),
            payload: json!({"id": "a", "data": "3"}),
        });
        h.pump().await;
        assert_eq!(h.relay.payloads("terminal:output").len(), 3);

        h.coordinator.clear_shared_secret();
        link.emit(DirectEvent::Undelivered {
            event: "terminal:output".to_string(),
            payload: json!({"id": "a", "data": "4"}),
        });
        h.pump().await;
        assert_eq!(h.relay.payloads("terminal:output").len(), 3);
    }

    #[tokio::test]
    async fn test_direct_loss_degrades_and_closes_link() {
        let mut h = harness();
        let link = h.negotiate().await;
        link.open_channel();
        h.pump().await;
        h.pump().await;

        link.drop_connection(DirectState::Failed);
        h.pump().await;

        assert_eq!(h.coordinator.phase(), TransportPhase::Degraded);
        assert!(link.is_closed());
        assert!(!h.coordinator.state().direct_channel_ready);

        // Renegotiation from Degraded
        h.coordinator.begin_negotiation().await.unwrap();
        assert_eq!(h.coordinator.phase(), TransportPhase::Negotiating);
        assert_eq!(h.connector.connected(), 2);
    }

    #[tokio::test]
    async fn test_stale_link_events_are_ignored() {
        let mut h = harness();
        let first = h.negotiate().await;
        h.coordinator.begin_negotiation().await.unwrap();
        h.pump().await;

        first.open_channel();
        h.pump().await;
        h.pump().await;
        assert_eq!(h.coordinator.phase(), TransportPhase::Negotiating);
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_data_channel_messages_are_returned() {
        let mut h = harness();
        let link = h.negotiate().await;
        link.emit(DirectEvent::Message("{\"action\":\"process:create\"}".to_string()));
        assert_eq!(
            h.pump().await.as_deref(),
            Some("{\"action\":\"process:create\"}")
        );
    }

    #[tokio::test]
    async fn test_peer_loss_closes_and_pairing_resets() {
        let mut h = harness();
        h.coordinator
            .set_shared_secret(SharedSecret::from_bytes([7u8; 32]));
        assert!(h.coordinator.is_trusted());

        let link = h.negotiate().await;
        h.coordinator.on_peer_fully_disconnected().await;
        assert_eq!(h.coordinator.phase(), TransportPhase::Closed);
        assert!(!h.coordinator.is_trusted());
        assert!(link.is_closed());
        assert!(h.coordinator.begin_negotiation().await.is_err());

        h.coordinator.on_paired().await;
        assert_eq!(h.coordinator.phase(), TransportPhase::Idle);
        assert!(h.coordinator.begin_negotiation().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_degrades() {
        let mut h = harness();
        h.connector.set_failing(true);
        assert!(h.coordinator.begin_negotiation().await.is_err());
        assert_eq!(h.coordinator.phase(), TransportPhase::Degraded);
    }

    #[tokio::test]
    async fn test_shutdown_closes_relay() {
        let mut h = harness();
        h.coordinator.shutdown().await;
        assert!(!h.relay.is_open());
        assert_eq!(h.coordinator.phase(), TransportPhase::Closed);
    }
}
