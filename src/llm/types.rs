use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::errors::ApiError;

/// End-of-turn markers. Backends spell the marker one of these ways and
/// both mean the reply is complete.
pub const END_OF_TURN_MARKERS: [&str; 2] = ["<|im_end|>", "<end_of_turn>"];

pub fn is_end_of_turn(chunk: &str) -> bool {
    let trimmed = chunk.trim();
    END_OF_TURN_MARKERS.iter().any(|marker| *marker == trimmed)
}

/// Chunks produced by a generation call, in emission order.
pub type TokenStream = mpsc::Receiver<Result<String, ApiError>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingMode {
    Greedy,
    Random { temperature: f32 },
}

impl SamplingMode {
    pub fn temperature(&self) -> f32 {
        match self {
            SamplingMode::Greedy => 0.0,
            SamplingMode::Random { temperature } => *temperature,
        }
    }

    pub fn top_k(&self) -> Option<u32> {
        match self {
            SamplingMode::Greedy => Some(1),
            SamplingMode::Random { .. } => None,
        }
    }
}

/// A rendered prompt ready for the completion backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub sampling: SamplingMode,
    pub max_tokens: usize,
    pub stop: Vec<String>,
}
