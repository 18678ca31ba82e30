//! Typed view over the merged `config.yml` + `secrets.yaml` document.
//!
//! Every field has a default so an empty config file yields a runnable
//! setup (models still need a name and download URI to be fetched).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::types::SamplingMode;

pub const DEFAULT_RESET_MESSAGE: &str = "Chat history has been reset.";
pub const DEFAULT_FALLBACK_MESSAGE: &str = "No relevant information found in the loaded sources to answer your query. Please try asking a different question.";

const ASSISTANT_SYSTEM_PROMPT: &str = "You are a chatbot that only responds to questions that are related to .Net. Simply reply with 'I don't know' when prompt is not related to .Net.";
const AGENT_SYSTEM_PROMPT: &str = "You are an expert RAG assistant, that only answers questions using the provided context. If the answer cannot be found in the context, respond with: 'I don't know.' Do not use outside knowledge or make assumptions.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub llm: LlmSettings,
    pub chat: ChatSettings,
    pub rag: RagSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// A model file name, optionally with a URI to download it from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub name: String,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplateKind {
    #[default]
    Chatml,
    Gemma,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Path to the `llama-server` binary; looked up under `bin/` and on PATH when unset.
    pub server_binary: Option<String>,
    pub models_dir: String,
    pub model: ModelSpec,
    pub embedding_model: ModelSpec,
    pub prompt_template: PromptTemplateKind,
    pub context_size: usize,
    pub n_gpu_layers: i32,
    /// Forces GPU support on or off; auto-detected when unset.
    pub gpu: Option<bool>,
    pub generation_port: u16,
    pub embedding_port: u16,
    pub load_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            server_binary: None,
            models_dir: "models".to_string(),
            model: ModelSpec::default(),
            embedding_model: ModelSpec {
                name: "bge-small-en-v1.5-f16.gguf".to_string(),
                uri: Some(
                    "https://huggingface.co/lm-kit/bge-1.5-gguf/resolve/main/bge-small-en-v1.5-f16.gguf?download=true"
                        .to_string(),
                ),
            },
            prompt_template: PromptTemplateKind::Chatml,
            context_size: 4096,
            n_gpu_layers: -1,
            gpu: None,
            generation_port: 8088,
            embedding_port: 8090,
            load_timeout_secs: 1800,
        }
    }
}

impl LlmSettings {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

/// Per-endpoint conversation setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationProfile {
    pub system_prompt: String,
    pub sampling: SamplingMode,
    pub max_completion_tokens: usize,
}

impl ConversationProfile {
    pub fn assistant() -> Self {
        Self {
            system_prompt: ASSISTANT_SYSTEM_PROMPT.to_string(),
            sampling: SamplingMode::Random { temperature: 0.8 },
            max_completion_tokens: 1000,
        }
    }

    pub fn agent() -> Self {
        Self {
            system_prompt: AGENT_SYSTEM_PROMPT.to_string(),
            sampling: SamplingMode::Greedy,
            max_completion_tokens: 512,
        }
    }
}

impl Default for ConversationProfile {
    fn default() -> Self {
        Self::agent()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub generation_timeout_secs: u64,
    pub reset_message: String,
    pub fallback_message: String,
    pub persist_fallback_turns: bool,
    pub assistant: ConversationProfile,
    pub agent: ConversationProfile,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            generation_timeout_secs: 120,
            reset_message: DEFAULT_RESET_MESSAGE.to_string(),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            persist_fallback_turns: false,
            assistant: ConversationProfile::assistant(),
            agent: ConversationProfile::agent(),
        }
    }
}

impl ChatSettings {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagSettings {
    pub collection_name: String,
    pub source_dir: String,
    pub max_chunk_size: usize,
    pub top_k_gpu: usize,
    pub top_k_cpu: usize,
    pub force_unique_section: bool,
    pub min_relevance_score: f32,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            collection_name: "Ebooks".to_string(),
            source_dir: "source-files".to_string(),
            max_chunk_size: 500,
            top_k_gpu: 3,
            top_k_cpu: 1,
            force_unique_section: true,
            min_relevance_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub history_db: String,
    pub embeddings_db: String,
    /// Presence switches the vector store to Qdrant.
    pub qdrant_url: Option<String>,
    pub qdrant_api_key: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            history_db: "history.db".to_string(),
            embeddings_db: "embeddings.db".to_string(),
            qdrant_url: None,
            qdrant_api_key: None,
        }
    }
}

impl StorageSettings {
    pub fn qdrant_url(&self) -> Option<&str> {
        self.qdrant_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}
