//! Relay-routed messages: handshake, WebRTC signaling and relay control
//!
//! None of these carry session I/O. They travel over the relay WebSocket
//! even after a direct channel is up.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{decode_tagged, encode_tagged, Envelope};
use crate::error::ProtocolError;

/// Pairing handshake messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum HandshakeMessage {
    /// Responder to initiator: our public key plus a challenge to sign
    #[serde(rename = "handshake:initiate")]
    Initiate {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "peerPublicKey")]
        peer_public_key: String,
        challenge: String,
    },

    /// Initiator to responder: HMAC of the challenge
    #[serde(rename = "handshake:response")]
    Response {
        #[serde(rename = "peerId")]
        peer_id: String,
        signature: String,
    },

    /// Same as `Response`, used by older peers
    #[serde(rename = "handshake:verify")]
    Verify {
        #[serde(rename = "peerId")]
        peer_id: String,
        signature: String,
    },

    #[serde(rename = "handshake:confirmed")]
    Confirmed {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },

    #[serde(rename = "handshake:error")]
    Error {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        error: String,
    },
}

impl HandshakeMessage {
    pub const ACTIONS: &'static [&'static str] = &[
        "handshake:initiate",
        "handshake:response",
        "handshake:verify",
        "handshake:confirmed",
        "handshake:error",
    ];

    pub fn decode(action: &str, payload: &Value) -> Result<Self, ProtocolError> {
        decode_tagged(action, payload)
    }

    /// Peer id carried by the message, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::Initiate { peer_id, .. }
            | Self::Response { peer_id, .. }
            | Self::Verify { peer_id, .. } => Some(peer_id),
            Self::Confirmed { peer_id } | Self::Error { peer_id, .. } => peer_id.as_deref(),
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        encode_tagged(self)
    }
}

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// WebRTC offer/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum SignalingMessage {
    #[serde(rename = "webrtc:offer")]
    Offer { sdp: String },

    #[serde(rename = "webrtc:answer")]
    Answer { sdp: String },

    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate(IceCandidate),
}

impl SignalingMessage {
    pub const ACTIONS: &'static [&'static str] =
        &["webrtc:offer", "webrtc:answer", "webrtc:ice-candidate"];

    pub fn decode(action: &str, payload: &Value) -> Result<Self, ProtocolError> {
        decode_tagged(action, payload)
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        encode_tagged(self)
    }
}

/// Messages exchanged with the relay server itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum RelayControl {
    /// Announce this device; sent on every (re)connect
    #[serde(rename = "relay:register")]
    Register {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "deviceName")]
        device_name: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    #[serde(rename = "relay:registered")]
    Registered {
        #[serde(rename = "deviceId", default)]
        device_id: Option<String>,
    },

    /// Relay introduced a peer
    #[serde(rename = "relay:paired")]
    Paired {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "peerPublicKey", default, skip_serializing_if = "Option::is_none")]
        peer_public_key: Option<String>,
    },

    /// Peer's relay socket dropped; it may come back
    #[serde(rename = "relay:peer-disconnected")]
    PeerDisconnected {
        #[serde(rename = "peerId", default)]
        peer_id: Option<String>,
    },

    /// Peer is gone for good
    #[serde(rename = "relay:peer-lost")]
    PeerLost {
        #[serde(rename = "peerId", default)]
        peer_id: Option<String>,
    },

    #[serde(rename = "relay:error")]
    Error { message: String },
}

impl RelayControl {
    pub const ACTIONS: &'static [&'static str] = &[
        "relay:register",
        "relay:registered",
        "relay:paired",
        "relay:peer-disconnected",
        "relay:peer-lost",
        "relay:error",
    ];

    pub fn decode(action: &str, payload: &Value) -> Result<Self, ProtocolError> {
        decode_tagged(action, payload)
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        encode_tagged(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_initiate_field_names() {
        let env = HandshakeMessage::Initiate {
            peer_id: "phone".to_string(),
            peer_public_key: "BASE64".to_string(),
            challenge: "abcd".to_string(),
        }
        .to_envelope()
        .unwrap();

        assert_eq!(env.action, "handshake:initiate");
        assert_eq!(env.payload["peerId"], "phone");
        assert_eq!(env.payload["peerPublicKey"], "BASE64");
    }

    #[test]
    fn test_confirmed_without_payload() {
        let msg = HandshakeMessage::decode("handshake:confirmed", &json!({})).unwrap();
        assert_eq!(msg, HandshakeMessage::Confirmed { peer_id: None });
    }

    #[test]
    fn test_ice_candidate_optional_fields() {
        let msg = SignalingMessage::decode(
            "webrtc:ice-candidate",
            &json!({"candidate": "candidate:1 1 udp 1 10.0.0.2 5000 typ host", "sdpMLineIndex": 0}),
        )
        .unwrap();
        match msg {
            SignalingMessage::IceCandidate(c) => {
                assert_eq!(c.sdp_mid, None);
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_relay_paired_with_key() {
        let msg = RelayControl::decode(
            "relay:paired",
            &json!({"peerId": "phone", "peerPublicKey": "KEY"}),
        )
        .unwrap();
        assert_eq!(
            msg,
            RelayControl::Paired {
                peer_id: "phone".to_string(),
                peer_public_key: Some("KEY".to_string()),
            }
        );
    }

    #[test]
    fn test_register_omits_missing_token() {
        let env = RelayControl::Register {
            device_id: "desk".to_string(),
            device_name: "workstation".to_string(),
            public_key: "KEY".to_string(),
            token: None,
        }
        .to_envelope()
        .unwrap();
        assert_eq!(env.action, "relay:register");
        assert!(env.payload.get("token").is_none());
    }
}
