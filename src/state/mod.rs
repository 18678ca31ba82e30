use std::sync::Arc;
use std::time::Instant;

use crate::chat::ChatOrchestrator;
use crate::core::config::settings::AppConfig;
use crate::core::config::{AppPaths, ConfigService};
use crate::history::{HistoryStore, SessionLocks, SqliteSessionCache};
use crate::llm::InferenceService;
use crate::rag::{RagEngine, RetrievalPolicy, SourceImport, TextChunking};
use crate::vector::connect_vector_store;

pub mod error;

use error::InitializationError;

/// Shared by every route.
///
/// - `chat`: plain assistant turns, no retrieval
/// - `agent`: turns grounded in the imported sources
pub struct AppState {
    pub settings: AppConfig,
    pub chat: Arc<ChatOrchestrator>,
    pub agent: Arc<ChatOrchestrator>,
    pub started_at: Instant,
    inference: Option<Arc<InferenceService>>,
}

impl AppState {
    /// Builds state around ready-made orchestrators.
    pub fn new(
        settings: AppConfig,
        chat: Arc<ChatOrchestrator>,
        agent: Arc<ChatOrchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            chat,
            agent,
            started_at: Instant::now(),
            inference: None,
        })
    }

    /// Wires the whole service from configuration.
    ///
    /// 1. Load settings
    /// 2. Open the history and vector stores
    /// 3. Build both orchestrators over one inference service
    /// 4. Warm up the models and import sources in the background
    pub async fn initialize(paths: Arc<AppPaths>) -> Result<Arc<Self>, InitializationError> {
        let config = ConfigService::new(paths.clone());
        let settings = config
            .load_settings()
            .map_err(|e| InitializationError::Config(e.into()))?;

        let history_path = paths.resolve(&settings.storage.history_db);
        let cache = SqliteSessionCache::with_path(history_path)
            .await
            .map_err(|e| InitializationError::History(e.into()))?;
        let history = HistoryStore::new(Arc::new(cache));

        let store = connect_vector_store(&settings.storage, &paths)
            .await
            .map_err(|e| InitializationError::VectorStore(e.into()))?;

        let inference = Arc::new(InferenceService::new(settings.llm.clone(), &paths));
        let policy = RetrievalPolicy::from_settings(&settings.rag);
        let rag = Arc::new(
            RagEngine::new(inference.clone(), store).with_min_relevance(policy.min_relevance_score),
        );
        rag.add_data_source(&settings.rag.collection_name);
        let sources = Arc::new(SourceImport::new(
            rag,
            paths.resolve(&settings.rag.source_dir),
            settings.rag.collection_name.clone(),
            TextChunking::new(settings.rag.max_chunk_size),
        ));

        let locks = SessionLocks::new();
        let chat = ChatOrchestrator::new(
            history.clone(),
            inference.clone(),
            settings.chat.assistant.clone(),
            settings.chat.clone(),
        )
        .with_locks(locks.clone());
        let agent = ChatOrchestrator::new(
            history,
            inference.clone(),
            settings.chat.agent.clone(),
            settings.chat.clone(),
        )
        .with_retriever(sources.clone(), policy)
        .with_locks(locks);

        spawn_warm_up(inference.clone(), sources);

        Ok(Arc::new(Self {
            settings,
            chat: Arc::new(chat),
            agent: Arc::new(agent),
            started_at: Instant::now(),
            inference: Some(inference),
        }))
    }

    /// Stops any model server processes.
    pub async fn shutdown(&self) {
        if let Some(inference) = &self.inference {
            inference.shutdown().await;
        }
    }
}

/// Loads the models and imports the sources ahead of the first request.
/// Either step that fails here is retried from the request path.
fn spawn_warm_up(inference: Arc<InferenceService>, sources: Arc<SourceImport>) {
    tokio::spawn(async move {
        if let Err(e) = inference.load().await {
            tracing::error!("Failed to load models: {}", e);
            return;
        }
        if let Err(e) = sources.ensure_imported().await {
            tracing::error!("Failed to import sources: {}", e);
        }
    });
}
