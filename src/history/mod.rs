//! Session transcripts and the cache they live in.
//!
//! A transcript is stored under its session id as a JSON array of
//! `{"Role": "...", "Content": "..."}` objects.

pub mod locks;
pub mod sqlite;
pub mod store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::ApiError;

pub use locks::SessionLocks;
pub use sqlite::SqliteSessionCache;
pub use store::{MemorySessionCache, SessionCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
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

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn encode(&self) -> Result<String, ApiError> {
        serde_json::to_string(&self.messages).map_err(ApiError::internal)
    }

    /// Decodes a stored transcript. Blank input is an empty transcript and
    /// entries with an unknown role are dropped.
    pub fn decode(raw: &str) -> Result<Self, ApiError> {
        if raw.trim().is_empty() {
            return Ok(Self::new());
        }

        let entries: Vec<Value> = serde_json::from_str(raw)
            .map_err(|err| ApiError::Internal(format!("Stored history is not readable: {}", err)))?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            let role = entry.get("Role").and_then(Value::as_str);
            let Some(role) = role.and_then(Role::parse) else {
                tracing::warn!(role = ?entry.get("Role"), "Skipping history entry with unknown role");
                continue;
            };
            let content = entry
                .get("Content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            messages.push(Message::new(role, content));
        }

        Ok(Self { messages })
    }
}

/// Loads and saves transcripts through a [`SessionCache`].
#[derive(Clone)]
pub struct HistoryStore {
    cache: Arc<dyn SessionCache>,
}

impl HistoryStore {
    pub fn new(cache: Arc<dyn SessionCache>) -> Self {
        Self { cache }
    }

    /// A cache miss is an empty transcript.
    pub async fn load(&self, session_id: &str) -> Result<Transcript, ApiError> {
        match self.cache.get_raw(session_id).await? {
            Some(raw) => Transcript::decode(&raw),
            None => Ok(Transcript::new()),
        }
    }

    pub async fn save(&self, session_id: &str, transcript: &Transcript) -> Result<(), ApiError> {
        let encoded = transcript.encode()?;
        self.cache.set_raw(session_id, &encoded).await?;
        tracing::debug!(
            session_id,
            messages = transcript.len(),
            "Saved session history"
        );
        Ok(())
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), ApiError> {
        self.cache.remove(session_id).await
    }
}
