//! Direct peer links over WebRTC (webrtc-rs)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use tether_core::error::TransportError;
use tether_core::traits::Transport;
use tether_protocol::{Envelope, IceCandidate};

use super::peer::{DirectEvent, DirectState, LinkEvent, LinkEventSender, PeerConnector, PeerLink};

/// Label of the single data channel the phone expects
pub const DATA_CHANNEL_LABEL: &str = "tether";

fn direct_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Direct(e.to_string())
}

fn direct_state(state: RTCPeerConnectionState) -> Option<DirectState> {
    match state {
        RTCPeerConnectionState::New => Some(DirectState::New),
        RTCPeerConnectionState::Connecting => Some(DirectState::Connecting),
        RTCPeerConnectionState::Connected => Some(DirectState::Connected),
        RTCPeerConnectionState::Disconnected => Some(DirectState::Disconnected),
        RTCPeerConnectionState::Failed => Some(DirectState::Failed),
        RTCPeerConnectionState::Closed => Some(DirectState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Sending half of the data channel
///
/// Sends are queued and written by a task so [`Transport::send`] stays
/// synchronous. Frames the task cannot write come back to the coordinator as
/// [`DirectEvent::Undelivered`] so they can go out over the relay instead.
pub struct DataChannelTransport {
    channel: Arc<RTCDataChannel>,
    outbound: mpsc::UnboundedSender<(String, Value)>,
    open: Arc<AtomicBool>,
}

impl DataChannelTransport {
    fn spawn(
        link: u64,
        channel: Arc<RTCDataChannel>,
        open: Arc<AtomicBool>,
        events: LinkEventSender,
    ) -> Self {
        let (outbound, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
        let writer = Arc::clone(&channel);
        let writable = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some((event, payload)) = rx.recv().await {
                if writable.load(Ordering::SeqCst) {
                    let text = Envelope::new(event.as_str(), payload.clone()).to_json();
                    match writer.send_text(text).await {
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(link, error = %e, %event, "Data channel write failed");
                            writable.store(false, Ordering::SeqCst);
                        }
                    }
                }
                let _ = events.send(LinkEvent {
                    link,
                    event: DirectEvent::Undelivered { event, payload },
                });
            }
        });
        Self {
            channel,
            outbound,
            open,
        }
    }
}

impl Transport for DataChannelTransport {
    fn send(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send((event.to_string(), payload.clone()))
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.channel.ready_state() == RTCDataChannelState::Open
    }

    fn name(&self) -> &'static str {
        "direct"
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// A webrtc-rs peer connection with one ordered data channel
pub struct WebRtcLink {
    peer: Arc<RTCPeerConnection>,
    channel: Arc<DataChannelTransport>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String, TransportError> {
        // Must be armed before the local description starts gathering
        let gathering = self.peer.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(gathering);

        let offer = self.peer.create_offer(None).await.map_err(direct_error)?;
        let sdp = offer.sdp.clone();
        self.peer
            .set_local_description(offer)
            .await
            .map_err(direct_error)?;
        Ok(sdp)
    }

    async fn gathering_complete(&self) {
        let pending = self.gathering.lock().await.take();
        if let Some(mut rx) = pending {
            let _ = rx.recv().await;
        }
    }

    async fn local_description(&self) -> Option<String> {
        self.peer.local_description().await.map(|desc| desc.sdp)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(direct_error)?;
        self.peer
            .set_remote_description(answer)
            .await
            .map_err(direct_error)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(direct_error)
    }

    fn channel(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.channel) as Arc<dyn Transport>
    }

    async fn close(&self) {
        self.channel.close();
        if let Err(e) = self.peer.close().await {
            tracing::debug!(error = %e, "Error closing peer connection");
        }
    }
}

/// Creates [`WebRtcLink`]s using the configured ICE servers
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        link: u64,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let api = APIBuilder::new().build();
        let peer = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(direct_error)?,
        );

        let state_events = events.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(link, state = ?state, "Peer connection state changed");
                if let Some(state) = direct_state(state) {
                    let _ = events.send(LinkEvent {
                        link,
                        event: DirectEvent::StateChanged(state),
                    });
                }
            })
        }));

        let candidate_events = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(LinkEvent {
                            link,
                            event: DirectEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        });
                    }
                    Err(e) => tracing::debug!(error = %e, "Could not encode local candidate"),
                }
            })
        }));

        let data_channel = peer
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(direct_error)?;

        let open = Arc::new(AtomicBool::new(false));

        let open_flag = Arc::clone(&open);
        let open_events = events.clone();
        data_channel.on_open(Box::new(move || {
            let open = Arc::clone(&open_flag);
            let events = open_events.clone();
            Box::pin(async move {
                open.store(true, Ordering::SeqCst);
                let _ = events.send(LinkEvent {
                    link,
                    event: DirectEvent::ChannelOpen,
                });
            })
        }));

        let close_flag = Arc::clone(&open);
        let close_events = events.clone();
        data_channel.on_close(Box::new(move || {
            let open = Arc::clone(&close_flag);
            let events = close_events.clone();
            Box::pin(async move {
                open.store(false, Ordering::SeqCst);
                let _ = events.send(LinkEvent {
                    link,
                    event: DirectEvent::ChannelClosed,
                });
            })
        }));

        let message_events = events.clone();
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = message_events.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(LinkEvent {
                            link,
                            event: DirectEvent::Message(text),
                        });
                    }
                    Err(_) => tracing::debug!("Ignoring binary data channel message"),
                }
            })
        }));

        let channel = Arc::new(DataChannelTransport::spawn(link, data_channel, open, events));
        Ok(Arc::new(WebRtcLink {
            peer,
            channel,
            gathering: Mutex::new(None),
        }) as Arc<dyn PeerLink>)
    }
}
