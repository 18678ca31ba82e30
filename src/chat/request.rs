use serde::Deserialize;

use crate::core::errors::ApiError;

/// Body of `POST /api/ai/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatPrompt {
    #[serde(default)]
    pub query: String,
    pub session_id: String,
    #[serde(default)]
    pub regenerate: bool,
    #[serde(default)]
    pub reset: bool,
}

/// Body of `POST /api/agent`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentRequest {
    #[serde(default)]
    pub question: String,
    pub session_id: String,
    #[serde(default)]
    pub regenerate: bool,
    #[serde(default)]
    pub reset: bool,
}

/// One conversational turn, independent of the endpoint it arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnRequest {
    pub session_id: String,
    pub query: String,
    pub regenerate: bool,
    pub reset: bool,
}

impl From<ChatPrompt> for TurnRequest {
    fn from(prompt: ChatPrompt) -> Self {
        Self {
            session_id: prompt.session_id,
            query: prompt.query,
            regenerate: prompt.regenerate,
            reset: prompt.reset,
        }
    }
}

impl From<AgentRequest> for TurnRequest {
    fn from(request: AgentRequest) -> Self {
        Self {
            session_id: request.session_id,
            query: request.question,
            regenerate: request.regenerate,
            reset: request.reset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnMode {
    Reset,
    Regenerate,
    Ask { query: String },
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn regenerate(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            regenerate: true,
            ..Self::default()
        }
    }

    pub fn reset(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            reset: true,
            ..Self::default()
        }
    }

    /// Validates the request and picks its mode. Reset wins over
    /// regenerate; only a plain question needs a query.
    pub fn mode(&self) -> Result<TurnMode, ApiError> {
        if self.session_id.trim().is_empty() {
            return Err(ApiError::BadRequest("sessionId is required.".to_string()));
        }
        if self.reset {
            return Ok(TurnMode::Reset);
        }
        if self.regenerate {
            return Ok(TurnMode::Regenerate);
        }
        let query = self.query.trim();
        if query.is_empty() {
            return Err(ApiError::BadRequest("A query is required.".to_string()));
        }
        Ok(TurnMode::Ask {
            query: query.to_string(),
        })
    }
}
