//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding or encoding wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Envelope carried neither `action` nor `type`
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Namespace outside the known set
    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    /// Action name outside the known set
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Payload did not match the shape required by its action
    #[error("Invalid payload for {action}: {source}")]
    InvalidPayload {
        action: String,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
