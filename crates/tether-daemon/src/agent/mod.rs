//! LLM agent that drives a terminal session

mod action;
mod completion;
mod conversation;
mod runner;
mod terminal;

pub use action::{parse_response, Action, AgentResponse};
pub use completion::{AnthropicCompletion, UnconfiguredCompletion};
pub use conversation::Conversation;
pub use runner::{AgentEvent, AgentLoop, AgentPhase, AGENT_EVENT_CHANNEL_CAPACITY};
pub use terminal::TerminalAccess;
