//! Classification of inbound envelopes

use crate::envelope::{Envelope, Namespace};
use crate::error::ProtocolError;
use crate::message::Command;
use crate::signaling::{HandshakeMessage, RelayControl, SignalingMessage};

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(Command),
    Handshake(HandshakeMessage),
    Signaling(SignalingMessage),
    Relay(RelayControl),
    /// Recognised namespace that this daemon does not serve (e.g. `code`)
    Unsupported { namespace: Namespace, action: String },
}

impl Inbound {
    /// Decode raw JSON text
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(&Envelope::parse(text)?)
    }

    /// Decode an already parsed envelope
    pub fn from_envelope(env: &Envelope) -> Result<Self, ProtocolError> {
        if env.namespace == Namespace::Code {
            return Ok(Inbound::Unsupported {
                namespace: env.namespace,
                action: env.action.clone(),
            });
        }

        let action = env.action.as_str();
        if HandshakeMessage::ACTIONS.contains(&action) {
            HandshakeMessage::decode(action, &env.payload).map(Inbound::Handshake)
        } else if SignalingMessage::ACTIONS.contains(&action) {
            SignalingMessage::decode(action, &env.payload).map(Inbound::Signaling)
        } else if RelayControl::ACTIONS.contains(&action) {
            RelayControl::decode(action, &env.payload).map(Inbound::Relay)
        } else {
            Command::decode(action, &env.payload).map(Inbound::Command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    #[test]
    fn test_legacy_command() {
        let inbound = Inbound::parse(r#"{"type":"process.terminate","payload":{"id":"a"}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Command(Command::TerminateProcess {
                id: SessionId::from("a")
            })
        );
    }

    #[test]
    fn test_signaling_answer() {
        let inbound =
            Inbound::parse(r#"{"namespace":"terminal","action":"webrtc:answer","payload":{"sdp":"v=0"}}"#)
                .unwrap();
        assert!(matches!(inbound, Inbound::Signaling(SignalingMessage::Answer { .. })));
    }

    #[test]
    fn test_code_namespace_unsupported() {
        let inbound =
            Inbound::parse(r#"{"namespace":"code","action":"file:read","payload":{"path":"/"}}"#).unwrap();
        assert!(matches!(inbound, Inbound::Unsupported { namespace: Namespace::Code, .. }));
    }

    #[test]
    fn test_unknown_action() {
        let err = Inbound::parse(r#"{"type":"bogus","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction(_)));
    }
}
