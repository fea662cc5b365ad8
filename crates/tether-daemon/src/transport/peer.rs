//! Seams around the WebRTC peer connection
//!
//! The coordinator drives a [`PeerLink`] and learns about everything the
//! connection does asynchronously through [`LinkEvent`]s. Every link gets a
//! fresh id so events from a torn-down link can be told apart.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tether_core::error::TransportError;
use tether_core::traits::Transport;
use tether_protocol::IceCandidate;

/// Connection state reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something that happened on a peer link
#[derive(Debug, Clone, PartialEq)]
pub enum DirectEvent {
    StateChanged(DirectState),
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    ChannelOpen,
    ChannelClosed,
    /// Text received on the data channel
    Message(String),
    /// A frame accepted for the data channel that was never written
    Undelivered { event: String, payload: Value },
    /// Local offer is ready to send; `complete` is false when gathering timed out
    OfferReady { sdp: String, complete: bool },
    OfferFailed(String),
}

/// A [`DirectEvent`] tagged with the link that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub link: u64,
    pub event: DirectEvent,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One peer connection with its data channel
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Resolves once local ICE gathering has finished
    async fn gathering_complete(&self);

    /// Current local description, including candidates gathered so far
    async fn local_description(&self) -> Option<String>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// The data channel as a transport
    fn channel(&self) -> Arc<dyn Transport>;

    /// Close the data channel and the peer connection
    async fn close(&self);
}

/// Factory for peer links
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open a new peer connection publishing its events tagged with `link`
    async fn connect(
        &self,
        link: u64,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, TransportError>;
}
