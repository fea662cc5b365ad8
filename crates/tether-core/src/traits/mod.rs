//! Core trait definitions

mod completion;
mod transport;

pub use completion::{ChatMessage, ChatRole, CompletionRequest, CompletionService};
pub use transport::Transport;
