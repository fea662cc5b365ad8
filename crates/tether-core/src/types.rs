//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier this daemon registers with the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a device ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random device ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Phase of the transport state machine for one pairing
///
/// ```text
/// Idle -> Negotiating -> Connected -> Degraded -> Negotiating ...
///                                 \-> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPhase {
    /// Paired (or waiting for a pairing), no direct negotiation yet
    #[default]
    Idle,
    /// Offer sent, waiting for the answer and ICE
    Negotiating,
    /// Direct data channel is up
    Connected,
    /// Direct channel lost, relay still carries traffic
    Degraded,
    /// Peer is gone
    Closed,
}

impl fmt::Display for TransportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportPhase::Idle => write!(f, "idle"),
            TransportPhase::Negotiating => write!(f, "negotiating"),
            TransportPhase::Connected => write!(f, "connected"),
            TransportPhase::Degraded => write!(f, "degraded"),
            TransportPhase::Closed => write!(f, "closed"),
        }
    }
}

/// What happens to sessions when the relay reports the peer as lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRetention {
    /// Keep sessions running for a later reconnect
    #[default]
    Keep,
    /// Terminate every session
    Terminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_device_ids_differ() {
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }

    #[test]
    fn test_transport_phase_display() {
        assert_eq!(format!("{}", TransportPhase::Degraded), "degraded");
        assert_eq!(TransportPhase::default(), TransportPhase::Idle);
    }

    #[test]
    fn test_retention_serde() {
        let value: SessionRetention = serde_json::from_str(r#""terminate""#).unwrap();
        assert_eq!(value, SessionRetention::Terminate);
    }
}
