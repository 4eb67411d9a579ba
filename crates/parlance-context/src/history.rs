//! Conversation history types

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, ContextResult};

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversational unit. Never mutated once appended to a history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// Length of the content in Unicode scalar values.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Total character count across all message contents.
pub fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum()
}

/// Ordered, append-only record of one chat session.
///
/// The history itself is never bounded; trimming happens on a copy when a
/// request is prepared (see [`crate::ContextPreparer`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message`. A system message is only accepted as the first entry.
    pub fn push(&mut self, message: Message) -> ContextResult<()> {
        if message.is_system() && !self.messages.is_empty() {
            return Err(ContextError::InvalidHistory(format!(
                "system message at index {}",
                self.messages.len()
            )));
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn total_chars(&self) -> usize {
        total_chars(&self.messages)
    }

    /// Serialize as a pretty-printed JSON array of `{role, content}` objects.
    pub fn export_json(&self) -> ContextResult<String> {
        Ok(serde_json::to_string_pretty(&self.messages)?)
    }

    /// Write the export format to `path`, replacing any existing file.
    pub fn export_to(&self, path: impl AsRef<Path>) -> ContextResult<()> {
        let json = self.export_json()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Parse a transcript previously produced by [`Self::export_json`].
    pub fn from_export_json(json: &str) -> ContextResult<Self> {
        let messages: Vec<Message> = serde_json::from_str(json)?;
        Self::try_from(messages)
    }
}

impl TryFrom<Vec<Message>> for ConversationHistory {
    type Error = ContextError;

    fn try_from(messages: Vec<Message>) -> ContextResult<Self> {
        if let Some(index) = messages.iter().skip(1).position(Message::is_system) {
            return Err(ContextError::InvalidHistory(format!(
                "system message at index {}",
                index + 1
            )));
        }
        Ok(Self { messages })
    }
}
