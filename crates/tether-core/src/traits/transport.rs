//! Transport trait

use serde_json::Value;

use crate::error::TransportError;

/// One message channel to the paired peer
///
/// Implemented by the relay WebSocket and the WebRTC data channel. Sends are
/// synchronous: implementations queue the encoded frame and return, so a
/// caller can fall back to another transport within the same call.
pub trait Transport: Send + Sync {
    /// Queue `event` with `payload` for delivery
    fn send(&self, event: &str, payload: &Value) -> Result<(), TransportError>;

    /// Whether the channel currently accepts messages
    fn is_open(&self) -> bool;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Stop accepting messages and release the underlying connection
    fn close(&self) {}
}
