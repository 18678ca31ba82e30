//! Multi-turn conversation state handed to the generation engine.

use crate::core::config::settings::ConversationProfile;
use crate::core::errors::ApiError;
use crate::history::{Message, Role, Transcript};
use crate::llm::types::SamplingMode;

const CHARS_PER_TOKEN: usize = 4;
const TOKENS_PER_MESSAGE: usize = 4;

#[derive(Debug, Clone)]
pub struct ConversationOptions {
    pub system_prompt: String,
    pub sampling: SamplingMode,
    pub max_completion_tokens: usize,
    pub context_size: usize,
}

impl ConversationOptions {
    pub fn from_profile(profile: &ConversationProfile, context_size: usize) -> Self {
        Self {
            system_prompt: profile.system_prompt.clone(),
            sampling: profile.sampling,
            max_completion_tokens: profile.max_completion_tokens,
            context_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    options: ConversationOptions,
    history: Vec<Message>,
}

impl Conversation {
    /// Seeds the conversation with a stored transcript. Stored system
    /// messages are replaced by the configured system prompt.
    pub fn new(transcript: &Transcript, options: ConversationOptions) -> Self {
        let history = transcript
            .messages()
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        Self { options, history }
    }

    pub fn options(&self) -> &ConversationOptions {
        &self.options
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn transcript(&self) -> Transcript {
        Transcript::from_messages(self.history.clone())
    }

    /// Prompt messages for a new user turn.
    pub fn prompt_for_submit(&self, user_text: &str) -> Vec<Message> {
        let mut turns = self.history.clone();
        turns.push(Message::user(user_text));
        self.bounded(turns)
    }

    /// Prompt messages that replay the last user turn without the reply
    /// that followed it.
    pub fn prompt_for_regenerate(&self) -> Result<Vec<Message>, ApiError> {
        let idx = self.last_user_index().ok_or_else(no_turn_to_regenerate)?;
        Ok(self.bounded(self.history[..=idx].to_vec()))
    }

    pub fn record_reply(&mut self, user_text: &str, reply: &str) {
        self.history.push(Message::user(user_text));
        self.history.push(Message::assistant(reply));
    }

    /// Replaces whatever followed the last user turn with `reply`.
    pub fn record_regenerated(&mut self, reply: &str) -> Result<(), ApiError> {
        let idx = self.last_user_index().ok_or_else(no_turn_to_regenerate)?;
        self.history.truncate(idx + 1);
        self.history.push(Message::assistant(reply));
        Ok(())
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn last_user_index(&self) -> Option<usize> {
        self.history.iter().rposition(|m| m.role == Role::User)
    }

    /// Drops the oldest turns until the estimated prompt plus the completion
    /// budget fits the context window. The newest turn is always kept.
    fn bounded(&self, mut turns: Vec<Message>) -> Vec<Message> {
        let budget = self
            .options
            .context_size
            .saturating_sub(self.options.max_completion_tokens);
        let system_cost = estimate_tokens(&self.options.system_prompt);

        let mut total: usize = system_cost + turns.iter().map(|m| estimate_tokens(&m.content)).sum::<usize>();
        let mut dropped = 0;
        while total > budget && turns.len() > 1 {
            let removed = turns.remove(0);
            total -= estimate_tokens(&removed.content);
            dropped += 1;
        }
        // A leading assistant reply without its question reads as noise.
        while turns.len() > 1 && turns[0].role == Role::Assistant {
            turns.remove(0);
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "Trimmed conversation history to fit context");
        }

        let mut messages = Vec::with_capacity(turns.len() + 1);
        if !self.options.system_prompt.trim().is_empty() {
            messages.push(Message::new(Role::System, self.options.system_prompt.clone()));
        }
        messages.extend(turns);
        messages
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) + TOKENS_PER_MESSAGE
}

fn no_turn_to_regenerate() -> ApiError {
    ApiError::BadRequest("There is no previous message to regenerate.".to_string())
}
