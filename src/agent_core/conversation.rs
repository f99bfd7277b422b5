//! Conversation — in-memory chat history for one chat session.
//!
//! Responsibilities:
//! - Hold the ordered message list sent to the decision model
//! - Put the optional system prompt first
//! - Roll back a failed query so the history never ends in an unanswered
//!   tool call

use crate::inference::types::{ChatMessage, ToolCall};

/// Ordered chat history. Nothing outlives the process.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    system_prompt: Option<String>,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(system_prompt: Option<String>) -> Self {
        Self {
            system_prompt: system_prompt.filter(|p| !p.trim().is_empty()),
            messages: Vec::new(),
        }
    }

    pub fn push_user(&mut self, text: &str) {
        self.messages.push(ChatMessage::user(text));
    }

    pub fn push_assistant(&mut self, text: &str) {
        self.messages.push(ChatMessage::assistant(text));
    }

    pub fn push_tool_calls(&mut self, text: Option<&str>, calls: &[ToolCall]) {
        self.messages.push(ChatMessage::assistant_tool_calls(text, calls));
    }

    pub fn push_tool_result(&mut self, call_id: &str, text: &str) {
        self.messages.push(ChatMessage::tool_result(call_id, text));
    }

    /// Messages to send, system prompt first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            out.push(ChatMessage::system(prompt));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    /// Position to roll back to with [`Conversation::truncate`].
    pub fn mark(&self) -> usize {
        self.messages.len()
    }

    /// Drop every message added after `mark`.
    pub fn truncate(&mut self, mark: usize) {
        self.messages.truncate(mark);
    }

    /// Number of messages, not counting the system prompt.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
