//! tether-daemon: Desktop daemon for Tether
//!
//! The daemon owns local shell sessions and exposes them to one paired phone.
//! Messages travel over a relay WebSocket until a direct WebRTC data channel
//! is up, and nothing is acted on until the peer passes the key-agreement
//! handshake. An optional agent loop lets a language model type into a
//! session on the user's behalf.

pub mod agent;
pub mod context;
pub mod daemon;
pub mod handshake;
pub mod pty;
pub mod router;
pub mod transport;

pub use context::{DaemonChannels, DaemonContext};
pub use daemon::run_event_loop;
pub use router::Router;
