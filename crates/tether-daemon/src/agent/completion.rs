//! Anthropic Messages API completion service

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use tether_core::config::AgentConfig;
use tether_core::error::AgentError;
use tether_core::traits::{ChatRole, CompletionRequest, CompletionService};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Completion service backed by the Anthropic HTTP API
#[derive(Clone)]
pub struct AnthropicCompletion {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicCompletion {
    pub fn new(api_key: impl Into<String>, config: &AgentConfig) -> Self {
        Self {
            client: Client::new(),
            api_url: config.api_url.clone(),
            api_key: api_key.into(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    /// Build from configuration, reading the key from `config.api_key_env`
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            AgentError::Completion(format!("{} is not set", config.api_key_env))
        })?;
        Ok(Self::new(api_key, config))
    }

    fn build_body(&self, request: &CompletionRequest) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system_text(request),
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
        }
    }
}

/// System prompt with the current screen token appended
fn system_text(request: &CompletionRequest) -> Option<String> {
    let mut system = request.system_prompt.clone();
    if let Some(screen_id) = &request.screen_id {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&format!("Current screen: {}", screen_id));
    }
    (!system.is_empty()).then_some(system)
}

#[async_trait]
impl CompletionService for AnthropicCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String, AgentError> {
        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            screen_id = ?request.screen_id,
            "Requesting completion"
        );

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.build_body(&request))
            .send()
            .await
            .map_err(|e| AgentError::Completion(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Completion(http_error_message(status, &body)));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Completion(format!("invalid response body: {}", e)))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();

        if text.trim().is_empty() {
            return Err(AgentError::Completion(
                "response contained no text".to_string(),
            ));
        }
        Ok(text)
    }
}

/// Stand-in used when no API key is configured; every prompt fails with
/// the reason
#[derive(Debug, Clone)]
pub struct UnconfiguredCompletion {
    reason: String,
}

impl UnconfiguredCompletion {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CompletionService for UnconfiguredCompletion {
    async fn complete(&self, _request: CompletionRequest) -> Result<String, AgentError> {
        Err(AgentError::Completion(self.reason.clone()))
    }
}

fn http_error_message(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or_else(|_| body.to_string());
    format!("HTTP {}: {}", status.as_u16(), message)
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}
