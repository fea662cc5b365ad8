//! Core error types for Tether

use std::path::PathBuf;
use tether_protocol::ProtocolError;
use thiserror::Error;

/// Top-level error type for the Tether daemon
#[derive(Error, Debug)]
pub enum TetherError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Handshake error
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Agent error
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// PTY could not be started
    #[error("Failed to spawn session {id}: {reason}")]
    SpawnFailed { id: String, reason: String },

    /// Operation referenced a session that does not exist
    #[error("Session not found: {0}")]
    UnknownSession(String),

    /// Session already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// PTY read/write failed
    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pairing handshake errors; every variant aborts the pairing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// No local key pair
    #[error("No local key pair")]
    MissingKeyPair,

    /// Peer public key could not be decoded or is not on the curve
    #[error("Invalid peer public key: {0}")]
    InvalidPublicKey(String),

    /// Challenge signature did not verify
    #[error("Challenge signature mismatch")]
    SignatureMismatch,

    /// Message arrived in a state that does not accept it
    #[error("Unexpected handshake message: {0}")]
    UnexpectedMessage(String),

    /// Handshake message before the relay introduced a peer
    #[error("No peer is paired")]
    NotPaired,

    /// Message names a different peer than the current pairing
    #[error("Handshake from {got}, but paired with {expected}")]
    PeerMismatch { expected: String, got: String },

    /// Key derivation or MAC setup failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The peer reported a failure
    #[error("Peer rejected handshake: {0}")]
    Rejected(String),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Channel is not open yet or any more
    #[error("Transport not open")]
    NotOpen,

    /// Channel was closed
    #[error("Transport closed")]
    Closed,

    /// Direct (WebRTC) channel failure
    #[error("Direct channel error: {0}")]
    Direct(String),

    /// Relay (WebSocket) failure
    #[error("Relay error: {0}")]
    Relay(String),

    /// Message could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] ProtocolError),
}

/// Agent loop errors
#[derive(Error, Debug)]
pub enum AgentError {
    /// A prompt is already running
    #[error("Agent is busy with another prompt")]
    Busy,

    /// Completion text was not a valid action list
    #[error("Could not parse agent response: {reason}")]
    Parse { reason: String, raw: String },

    /// Completion service call failed
    #[error("Completion failed: {0}")]
    Completion(String),

    /// Loop ran out of turns
    #[error("Turn limit of {0} reached")]
    TurnLimit(u32),

    /// No session to drive
    #[error("No target session")]
    NoSession,

    /// Loop was cancelled
    #[error("Agent cancelled")]
    Cancelled,
}

impl AgentError {
    /// Raw completion text, kept for diagnostics on parse failures
    pub fn raw(&self) -> Option<&str> {
        match self {
            AgentError::Parse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
