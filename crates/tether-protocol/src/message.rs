//! Command and event types for the Tether protocol
//!
//! Commands flow from the mobile peer to the daemon, events flow back. Both
//! are adjacently tagged (`{"action": ..., "payload": ...}`) so they map one to
//! one onto the wire envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{decode_tagged, encode_tagged, Envelope};
use crate::error::ProtocolError;
use crate::session::SessionId;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Kind of a quick action button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickActionKind {
    /// Typed verbatim
    Text,
    /// Typed and submitted with a carriage return
    Command,
}

/// One entry of a `terminal:actions` batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickAction {
    #[serde(rename = "type")]
    pub kind: QuickActionKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl QuickAction {
    /// Bytes to write to the terminal for this action
    pub fn to_input(&self) -> String {
        match self.kind {
            QuickActionKind::Text => self.value.clone(),
            QuickActionKind::Command => format!("{}\r", self.value),
        }
    }
}

/// Session entry reported in `processes:sync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(
        rename = "workingDirectory",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub working_directory: Option<String>,
}

/// Commands sent by the mobile peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum Command {
    /// Spawn a new shell session
    #[serde(rename = "process:create")]
    CreateProcess {
        id: SessionId,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        name: Option<String>,
    },

    /// Kill a session
    #[serde(rename = "process:terminate")]
    TerminateProcess { id: SessionId },

    /// Replace the active set
    #[serde(rename = "process:switch")]
    SwitchProcesses {
        #[serde(rename = "activeIds")]
        active_ids: Vec<SessionId>,
    },

    /// Change a session's display name
    #[serde(rename = "process:rename")]
    RenameProcess { id: SessionId, name: String },

    /// Raw keyboard input
    #[serde(rename = "terminal:input")]
    Input { id: SessionId, data: String },

    /// Resize one session, or every session when `id` is absent
    #[serde(rename = "terminal:resize")]
    Resize {
        #[serde(default)]
        id: Option<SessionId>,
        cols: u16,
        rows: u16,
    },

    /// Batch of quick action buttons
    #[serde(rename = "terminal:actions")]
    QuickActions {
        id: SessionId,
        actions: Vec<QuickAction>,
    },

    /// Hand a session to the agent
    #[serde(rename = "ai:prompt")]
    AiPrompt {
        prompt: String,
        #[serde(default)]
        id: Option<SessionId>,
    },

    /// Stop the running agent loop
    #[serde(rename = "ai:cancel")]
    AiCancel {},

    /// Ask for a fresh `processes:sync`
    #[serde(rename = "processes:request-sync")]
    RequestSync {},
}

impl Command {
    /// Every action name decoded as a command
    pub const ACTIONS: &'static [&'static str] = &[
        "process:create",
        "process:terminate",
        "process:switch",
        "process:rename",
        "terminal:input",
        "terminal:resize",
        "terminal:actions",
        "ai:prompt",
        "ai:cancel",
        "processes:request-sync",
    ];

    /// Whether `action` names a command
    pub fn is_command(action: &str) -> bool {
        Self::ACTIONS.contains(&action)
    }

    /// Decode a command from its action name and payload
    pub fn decode(action: &str, payload: &Value) -> Result<Self, ProtocolError> {
        if !Self::is_command(action) {
            return Err(ProtocolError::UnknownAction(action.to_string()));
        }
        decode_tagged(action, payload)
    }

    /// Session the command targets, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Command::CreateProcess { id, .. }
            | Command::TerminateProcess { id }
            | Command::RenameProcess { id, .. }
            | Command::Input { id, .. }
            | Command::QuickActions { id, .. } => Some(id),
            Command::Resize { id, .. } | Command::AiPrompt { id, .. } => id.as_ref(),
            Command::SwitchProcesses { .. } | Command::AiCancel {} | Command::RequestSync {} => {
                None
            }
        }
    }
}

/// Events emitted by the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum Event {
    #[serde(rename = "process:created")]
    ProcessCreated {
        id: SessionId,
        name: String,
        #[serde(rename = "createdAt")]
        created_at: u64,
        #[serde(
            rename = "workingDirectory",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        working_directory: Option<String>,
    },

    #[serde(rename = "process:terminated")]
    ProcessTerminated { id: SessionId },

    #[serde(rename = "process:exited")]
    ProcessExited {
        id: SessionId,
        #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    #[serde(rename = "process:error")]
    ProcessError { id: SessionId, error: String },

    #[serde(rename = "process:renamed")]
    ProcessRenamed { id: SessionId, name: String },

    /// Live output of an active session
    #[serde(rename = "terminal:output")]
    TerminalOutput { id: SessionId, data: String },

    /// Buffered backlog sent when a session becomes active
    #[serde(rename = "process:screen")]
    ProcessScreen { id: SessionId, data: String },

    #[serde(rename = "processes:sync")]
    ProcessesSync {
        processes: Vec<SessionSummary>,
        #[serde(rename = "activeIds")]
        active_ids: Vec<SessionId>,
    },

    #[serde(rename = "ai:thinking")]
    AiThinking { text: String },

    #[serde(rename = "ai:message")]
    AiMessage { text: String },

    /// An action the agent is about to execute
    #[serde(rename = "ai:action")]
    AiAction { action: Value },

    #[serde(rename = "ai:complete")]
    AiComplete { turns: u32 },

    #[serde(rename = "ai:error")]
    AiError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },

    /// Generic error not tied to a session
    #[serde(rename = "error")]
    Error { message: String },
}

impl Event {
    /// Encode into an outbound envelope
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        encode_tagged(self)
    }

    /// Action name and payload for a `Transport::send` call
    pub fn into_parts(&self) -> Result<(String, Value), ProtocolError> {
        let env = self.to_envelope()?;
        Ok((env.action, env.payload))
    }
}
