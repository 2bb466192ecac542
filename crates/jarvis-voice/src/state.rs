//! Session data model: assistant state, chat history and the observable snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Current phase of the session. Owned by the turn controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssistantState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    Error,
}

impl AssistantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssistantState::Idle => "IDLE",
            AssistantState::Listening => "LISTENING",
            AssistantState::Thinking => "THINKING",
            AssistantState::Speaking => "SPEAKING",
            AssistantState::Error => "ERROR",
        }
    }

    /// An awake session accepts a bare command without the wake phrase.
    pub fn is_awake(&self) -> bool {
        matches!(self, AssistantState::Listening)
    }
}

impl fmt::Display for AssistantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            sources: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            sources,
        }
    }
}

/// Append-only, timestamp-ordered conversation log. Cloning is cheap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatHistory {
    messages: Arc<Vec<ChatMessage>>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted messages, restoring timestamp order.
    pub fn from_messages(mut messages: Vec<ChatMessage>) -> Self {
        messages.sort_by_key(|m| m.timestamp);
        Self {
            messages: Arc::new(messages),
        }
    }

    /// Append a message. A timestamp older than the last entry is clamped forward.
    pub fn push(&mut self, mut message: ChatMessage) {
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        Arc::make_mut(&mut self.messages).push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn shared(&self) -> Arc<Vec<ChatMessage>> {
        Arc::clone(&self.messages)
    }
}

/// A dispatched user utterance.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    pub utterance: String,
    pub started: Instant,
}

impl Turn {
    pub fn new(id: u64, utterance: impl Into<String>) -> Self {
        Self {
            id,
            utterance: utterance.into(),
            started: Instant::now(),
        }
    }
}

/// What the presentation layer sees after every controller event.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub state: AssistantState,
    pub transcript: String,
    pub history: Arc<Vec<ChatMessage>>,
    pub paused: bool,
    pub online: bool,
}
