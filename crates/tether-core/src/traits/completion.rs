//! Completion service trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Speaker of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One conversation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Input for one agent turn
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt describing the action format
    pub system_prompt: String,
    /// Conversation so far, oldest first
    pub messages: Vec<ChatMessage>,
    /// Identity of the screen the last user message describes
    pub screen_id: Option<String>,
}

/// LLM backend used by the agent loop
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Return the raw completion text for `request`
    async fn complete(&self, request: CompletionRequest) -> Result<String, AgentError>;
}
