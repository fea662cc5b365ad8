//! Wire envelope encoding/decoding
//!
//! Two inbound forms are accepted:
//!
//! - namespaced: `{"namespace": "terminal", "action": "process:create", "payload": {...}}`
//! - legacy flat: `{"type": "process:create", "payload": {...}}`
//!
//! Action names may use either `.` or `:` as separator; they are normalized
//! to the colon form. Outbound envelopes carry both `action` and `type` so a
//! peer reading either form can decode them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::ProtocolError;

/// Product surface an envelope belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Terminal sessions, handshake, signaling, agent
    Terminal,
    /// Code editor and file browser
    Code,
}

impl Namespace {
    /// Wire name of the namespace
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Terminal => "terminal",
            Namespace::Code => "code",
        }
    }

    fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value {
            "terminal" => Ok(Namespace::Terminal),
            "code" => Ok(Namespace::Code),
            other => Err(ProtocolError::UnknownNamespace(other.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    namespace: Option<String>,
    action: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// A decoded wire envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Namespace the action belongs to
    pub namespace: Namespace,
    /// Colon-separated action name, e.g. `terminal:input`
    pub action: String,
    /// Action payload (always an object; absent payloads decode as `{}`)
    pub payload: Value,
    /// Whether the envelope arrived in the legacy `{type, payload}` form
    pub legacy: bool,
}

impl Envelope {
    /// Build an envelope in the terminal namespace
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            namespace: Namespace::Terminal,
            action: normalize_action(&action.into()),
            payload: normalize_payload(payload),
            legacy: false,
        }
    }

    /// Decode an envelope from JSON text
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnvelope) -> Result<Self, ProtocolError> {
        let (action, legacy) = match (raw.action, raw.kind) {
            (Some(action), _) => (action, false),
            (None, Some(kind)) => (kind, true),
            (None, None) => {
                return Err(ProtocolError::InvalidEnvelope(
                    "missing both `action` and `type`".to_string(),
                ))
            }
        };

        let action = normalize_action(&action);
        if action.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty action".to_string()));
        }

        let namespace = match raw.namespace {
            Some(ns) => Namespace::parse(&ns)?,
            None if action.starts_with("code:") => Namespace::Code,
            None => Namespace::Terminal,
        };

        Ok(Self {
            namespace,
            action,
            payload: normalize_payload(raw.payload),
            legacy,
        })
    }

    /// Encode for the wire, readable by both namespaced and legacy peers
    pub fn to_json(&self) -> String {
        json!({
            "namespace": self.namespace.as_str(),
            "action": self.action,
            "type": self.action,
            "payload": self.payload,
        })
        .to_string()
    }
}

/// Split an adjacently tagged message (`{"action", "payload"}`) into an envelope
pub fn encode_tagged<T: Serialize>(message: &T) -> Result<Envelope, ProtocolError> {
    let mut value = serde_json::to_value(message)?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::InvalidEnvelope("message has no action tag".to_string()))?;
    let payload = value
        .as_object_mut()
        .and_then(|obj| obj.remove("payload"))
        .unwrap_or(Value::Null);
    Ok(Envelope::new(action, payload))
}

/// Rebuild an adjacently tagged message from an action name and payload
pub fn decode_tagged<T: DeserializeOwned>(action: &str, payload: &Value) -> Result<T, ProtocolError> {
    serde_json::from_value(json!({ "action": action, "payload": payload })).map_err(|source| {
        ProtocolError::InvalidPayload {
            action: action.to_string(),
            source,
        }
    })
}

/// Normalize dotted action names to the colon form
pub fn normalize_action(action: &str) -> String {
    action.trim().replace('.', ":")
}

fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}
