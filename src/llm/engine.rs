use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::config::settings::ConversationProfile;
use crate::core::errors::ApiError;
use crate::history::Transcript;
use crate::llm::conversation::Conversation;
use crate::llm::types::TokenStream;

/// Streaming text generation over a multi-turn conversation.
///
/// The returned stream yields chunks as the model produces them and ends
/// with an end-of-turn marker once the reply is complete. Cancelling the
/// token stops production; chunks already sent stay sent.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    fn new_conversation(&self, history: &Transcript, profile: &ConversationProfile)
        -> Conversation;

    /// Loads whatever generation needs. Called before the generation
    /// deadline starts; a load is bounded by its own timeout.
    async fn prepare(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn submit(
        &self,
        conversation: &Conversation,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError>;

    /// Re-runs the last user turn, ignoring the reply that followed it.
    async fn regenerate(
        &self,
        conversation: &Conversation,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError>;

    fn has_gpu_support(&self) -> bool;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError>;
}
