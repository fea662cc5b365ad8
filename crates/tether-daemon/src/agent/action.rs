//! Actions the model can ask for, and parsing of its replies

use serde::{Deserialize, Deserializer, Serialize};

use tether_core::error::AgentError;

use crate::pty::ScreenWindow;

/// One step requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Bytes to type into the terminal
    Keystroke { value: String },

    /// Pause before the next action
    Delay {
        #[serde(deserialize_with = "deserialize_millis")]
        ms: u64,
    },

    /// Look at the screen again before the next turn
    #[serde(alias = "requestScreen")]
    RequestScreen {
        #[serde(
            rename = "sliceStart",
            alias = "slice_start",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        slice_start: Option<usize>,
        #[serde(
            rename = "sliceEnd",
            alias = "slice_end",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        slice_end: Option<usize>,
    },

    /// Text for the user; no terminal side effect
    Message { text: String },
}

/// Whole or fractional milliseconds; negative waits are zero
fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let ms = f64::deserialize(deserializer)?;
    Ok(ms.max(0.0).round() as u64)
}

impl Action {
    /// Screen window for a `request_screen`, filling in defaults
    pub fn screen_window(&self, default_chars: usize) -> Option<ScreenWindow> {
        match self {
            Action::RequestScreen {
                slice_start,
                slice_end,
            } => {
                let end = slice_end.unwrap_or(0);
                let start = slice_start.unwrap_or(end.saturating_add(default_chars));
                Some(ScreenWindow { start, end })
            }
            _ => None,
        }
    }
}

/// A parsed model reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

/// Parse a completion into an [`AgentResponse`].
///
/// Accepts bare JSON, JSON in a fenced code block, or JSON surrounded by
/// prose. Anything else is a parse error carrying the raw text.
pub fn parse_response(raw: &str) -> Result<AgentResponse, AgentError> {
    let body = strip_code_fence(raw.trim());

    let first_error = match serde_json::from_str::<AgentResponse>(body) {
        Ok(response) => return Ok(response),
        Err(e) => e,
    };

    if let Some(object) = outermost_object(body) {
        if object.len() != body.len() {
            if let Ok(response) = serde_json::from_str::<AgentResponse>(object) {
                return Ok(response);
            }
        }
    }

    Err(AgentError::Parse {
        reason: first_error.to_string(),
        raw: raw.to_string(),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (`json`, ...) on the opening line
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
