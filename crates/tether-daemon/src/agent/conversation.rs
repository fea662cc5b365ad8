//! Per-prompt conversation with bounded history

use tether_core::traits::{ChatMessage, ChatRole};

/// Messages exchanged during one prompt, oldest first.
///
/// The first message (the user's request and the initial screen) is always
/// kept; beyond that only the most recent messages survive trimming.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    max_history: usize,
}

impl Conversation {
    pub fn new(max_history: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_history: max_history.max(2),
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
        self.trim();
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
        self.trim();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn trim(&mut self) {
        if self.messages.len() <= self.max_history {
            return;
        }

        let mut cut = self.messages.len() - (self.max_history - 1);
        // Keep roles alternating after the pinned first message
        while cut < self.messages.len() && self.messages[cut].role == ChatRole::User {
            cut += 1;
        }
        self.messages.drain(1..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(conversation: &Conversation) -> Vec<&str> {
        conversation
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect()
    }

    #[test]
    fn test_under_limit_keeps_everything() {
        let mut conversation = Conversation::new(4);
        conversation.push_user("u0");
        conversation.push_assistant("a0");
        conversation.push_user("u1");
        assert_eq!(contents(&conversation), vec!["u0", "a0", "u1"]);
    }

    #[test]
    fn test_trim_keeps_first_and_recent() {
        let mut conversation = Conversation::new(4);
        conversation.push_user("u0");
        for n in 0..4 {
            conversation.push_assistant(format!("a{}", n));
            conversation.push_user(format!("u{}", n + 1));
        }

        assert!(conversation.len() <= 4);
        let kept = contents(&conversation);
        assert_eq!(kept[0], "u0");
        assert_eq!(*kept.last().unwrap(), "u4");
        assert_eq!(conversation.messages()[1].role, ChatRole::Assistant);
    }

    #[test]
    fn test_roles_alternate_after_trim() {
        let mut conversation = Conversation::new(3);
        conversation.push_user("u0");
        for n in 0..6 {
            conversation.push_assistant(format!("a{}", n));
            conversation.push_user(format!("u{}", n + 1));

            let roles: Vec<ChatRole> = conversation.messages().iter().map(|m| m.role).collect();
            for pair in roles.windows(2) {
                assert_ne!(pair[0], pair[1], "roles must alternate: {:?}", roles);
            }
        }
    }
}
