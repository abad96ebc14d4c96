use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::MessageRole;

/// One displayed line of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatEntry {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Append-only transcript of one conversation: user utterances and final assistant replies.
///
/// Intermediate tool traffic of a turn is not kept; each turn starts the engine from these
/// `(role, content)` pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    entries: Vec<ChatEntry>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: ChatEntry) {
        self.entries.push(entry);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatEntry::new(MessageRole::User, content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatEntry::new(MessageRole::Assistant, content));
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&ChatEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The transcript as the `(role, content)` pairs a turn is seeded with.
    pub fn as_pairs(&self) -> Vec<(MessageRole, String)> {
        self.entries
            .iter()
            .map(|entry| (entry.role, entry.content.clone()))
            .collect()
    }
}
