//! Agent loop configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;

/// Configuration for the LLM agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model name sent to the completion service
    pub model: String,

    /// Messages API endpoint
    pub api_url: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Maximum tokens per completion
    pub max_tokens: u32,

    /// Turns per prompt before giving up
    pub max_turns: u32,

    /// Conversation messages kept (first message always retained)
    pub max_history: usize,

    /// Characters of screen sent by default
    pub screen_chars: usize,

    /// Wait before capturing a requested screen
    #[serde(with = "duration_millis")]
    pub settle_delay: Duration,

    /// Cap on a single `delay` action
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 4096,
            max_turns: 10,
            max_history: 20,
            screen_chars: 4000,
            settle_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
        }
    }
}
