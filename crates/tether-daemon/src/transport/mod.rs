//! Transports to the paired phone
//!
//! The relay WebSocket is always available; a WebRTC data channel is
//! negotiated over it and preferred when open.

mod coordinator;
mod direct;
pub mod memory;
mod peer;
mod reconnect;
mod relay;

pub use coordinator::{TransportCoordinator, TransportState};
pub use direct::{DataChannelTransport, WebRtcConnector, WebRtcLink, DATA_CHANNEL_LABEL};
pub use peer::{DirectEvent, DirectState, LinkEvent, LinkEventSender, PeerConnector, PeerLink};
pub use reconnect::ExponentialBackoff;
pub use relay::{RelayClient, RelayEvent, RelayTransport};
