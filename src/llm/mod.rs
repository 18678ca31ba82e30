pub mod conversation;
pub mod engine;
pub mod llama_service;
pub mod models;
pub mod service;
pub mod template;
pub mod types;

pub use conversation::{Conversation, ConversationOptions};
pub use engine::{Embedder, GenerationEngine};
pub use service::InferenceService;
pub use types::{is_end_of_turn, SamplingMode, TokenStream};
