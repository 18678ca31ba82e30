use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::core::config::settings::{ConversationProfile, LlmSettings};
use crate::core::config::AppPaths;
use crate::core::errors::ApiError;
use crate::history::{Message, Transcript};
use crate::llm::conversation::{Conversation, ConversationOptions};
use crate::llm::engine::{Embedder, GenerationEngine};
use crate::llm::llama_service::{LlamaServer, LlamaServerConfig};
use crate::llm::models::{progress_logger, ModelLoader};
use crate::llm::types::{CompletionRequest, END_OF_TURN_MARKERS, TokenStream};

#[derive(Debug)]
struct LoadedModels {
    generation: LlamaServerConfig,
    embedding: LlamaServerConfig,
}

/// Owns the generation and embedding model handles.
///
/// Both are loaded once, on first use or by an explicit [`load`](Self::load);
/// concurrent callers wait on the same initialization.
pub struct InferenceService {
    settings: LlmSettings,
    loader: ModelLoader,
    generator: LlamaServer,
    embedder: LlamaServer,
    models: OnceCell<LoadedModels>,
    gpu: bool,
}

impl InferenceService {
    pub fn new(settings: LlmSettings, paths: &AppPaths) -> Self {
        let server_path = LlamaServer::find_server_binary(paths, settings.server_binary.as_deref());
        let loader = ModelLoader::new(paths.resolve(&settings.models_dir));
        let gpu = settings.gpu.unwrap_or_else(|| detect_gpu(settings.n_gpu_layers));
        tracing::info!(gpu, server = %server_path.display(), "Inference service configured");

        Self {
            loader,
            generator: LlamaServer::new("llama-generation", server_path.clone()),
            embedder: LlamaServer::new("llama-embedding", server_path),
            models: OnceCell::new(),
            gpu,
            settings,
        }
    }

    /// Loads both models, bounded by `llm.load_timeout_secs`. A failed
    /// attempt leaves the service unloaded so the next call retries.
    pub async fn load(&self) -> Result<(), ApiError> {
        self.models().await.map(|_| ())
    }

    pub fn is_ready(&self) -> bool {
        self.models.initialized()
    }

    pub async fn shutdown(&self) {
        self.generator.shutdown().await;
        self.embedder.shutdown().await;
    }

    async fn models(&self) -> Result<&LoadedModels, ApiError> {
        let timeout = self.settings.load_timeout();
        self.models
            .get_or_try_init(|| async {
                match tokio::time::timeout(timeout, self.initialize()).await {
                    Ok(result) => result,
                    Err(_) => Err(ApiError::ServiceUnavailable(format!(
                        "Model loading timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await
    }

    async fn initialize(&self) -> Result<LoadedModels, ApiError> {
        let generation_progress = progress_logger("generation");
        let generation_path = self
            .loader
            .ensure_local(&self.settings.model, Some(&generation_progress))
            .await?;

        let embedding_progress = progress_logger("embedding");
        let embedding_path = self
            .loader
            .ensure_local(&self.settings.embedding_model, Some(&embedding_progress))
            .await?;

        let models = LoadedModels {
            generation: self.server_config(generation_path, self.settings.generation_port, false),
            embedding: self.server_config(embedding_path, self.settings.embedding_port, true),
        };

        self.generator.ensure_running(&models.generation).await?;
        self.embedder.ensure_running(&models.embedding).await?;
        tracing::info!("Generation and embedding models loaded");
        Ok(models)
    }

    fn server_config(&self, model_path: PathBuf, port: u16, embedding: bool) -> LlamaServerConfig {
        LlamaServerConfig {
            model_path,
            port,
            context_size: self.settings.context_size,
            n_gpu_layers: if self.gpu { self.settings.n_gpu_layers } else { 0 },
            embedding,
        }
    }

    async fn stream(
        &self,
        conversation: &Conversation,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError> {
        let models = self.models().await?;
        self.generator.ensure_running(&models.generation).await?;

        let template = self.settings.prompt_template;
        let options = conversation.options();
        let request = CompletionRequest {
            prompt: template.render(&messages),
            sampling: options.sampling,
            max_tokens: options.max_completion_tokens,
            stop: END_OF_TURN_MARKERS.iter().map(|m| m.to_string()).collect(),
        };

        self.generator
            .stream_completion(request, template.end_marker(), cancel)
            .await
    }
}

fn detect_gpu(n_gpu_layers: i32) -> bool {
    n_gpu_layers != 0 && which::which("nvidia-smi").is_ok()
}

#[async_trait]
impl GenerationEngine for InferenceService {
    fn new_conversation(&self, history: &Transcript, profile: &ConversationProfile) -> Conversation {
        Conversation::new(
            history,
            ConversationOptions::from_profile(profile, self.settings.context_size),
        )
    }

    async fn prepare(&self) -> Result<(), ApiError> {
        self.load().await
    }

    async fn submit(
        &self,
        conversation: &Conversation,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError> {
        let messages = conversation.prompt_for_submit(user_text);
        self.stream(conversation, messages, cancel).await
    }

    async fn regenerate(
        &self,
        conversation: &Conversation,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError> {
        let messages = conversation.prompt_for_regenerate()?;
        self.stream(conversation, messages, cancel).await
    }

    fn has_gpu_support(&self) -> bool {
        self.gpu
    }
}

#[async_trait]
impl Embedder for InferenceService {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let models = self.models().await?;
        self.embedder.ensure_running(&models.embedding).await?;
        self.embedder.embed(inputs).await
    }
}
