//! tether-protocol: Wire protocol for Tether remote terminal sessions
//!
//! This crate defines the JSON envelopes exchanged between the desktop
//! daemon and a paired mobile device, over either the direct WebRTC data
//! channel or the relay WebSocket. Both transports carry the same messages.

pub mod envelope;
pub mod error;
pub mod inbound;
pub mod message;
pub mod session;
pub mod signaling;

pub use envelope::{Envelope, Namespace};
pub use error::ProtocolError;
pub use inbound::Inbound;
pub use message::{Command, Event, QuickAction, QuickActionKind, SessionSummary, TerminalSize};
pub use session::SessionId;
pub use signaling::{HandshakeMessage, IceCandidate, RelayControl, SignalingMessage};
