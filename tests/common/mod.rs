#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blinkchat_backend::chat::ChatOrchestrator;
use blinkchat_backend::core::config::settings::{ChatSettings, ConversationProfile};
use blinkchat_backend::core::errors::ApiError;
use blinkchat_backend::history::{HistoryStore, MemorySessionCache, SessionCache, Transcript};
use blinkchat_backend::llm::{Conversation, ConversationOptions, GenerationEngine, TokenStream};
use blinkchat_backend::rag::{PartitionSimilarity, RetrievalPolicy, Retriever};

pub const END: &str = "<|im_end|>";

/// One scripted reply: chunks sent in order, then optionally a stall
/// that lasts until the turn is cancelled.
#[derive(Clone, Default)]
pub struct Script {
    pub chunks: Vec<Result<String, ApiError>>,
    pub stall: bool,
}

impl Script {
    pub fn reply(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| Ok(c.to_string())).collect(),
            stall: false,
        }
    }

    pub fn stalled(chunks: &[&str]) -> Self {
        Self {
            stall: true,
            ..Self::reply(chunks)
        }
    }
}

#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<String>>,
    pub submits: AtomicUsize,
    pub regenerates: AtomicUsize,
    pub prepares: AtomicUsize,
    pub prepare_delay: Duration,
    pub cancelled: Arc<AtomicBool>,
    pub gpu: bool,
}

impl ScriptedEngine {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    pub fn with_gpu(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            gpu: true,
            ..Self::default()
        })
    }

    /// An engine whose model load takes `delay`.
    pub fn slow_to_prepare(scripts: Vec<Script>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            prepare_delay: delay,
            ..Self::default()
        })
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn regenerates(&self) -> usize {
        self.regenerates.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn play(&self, cancel: CancellationToken) -> TokenStream {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::reply(&["ok", END]));
        let cancelled = self.cancelled.clone();
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            for chunk in script.chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if script.stall {
                tokio::select! {
                    _ = cancel.cancelled() => cancelled.store(true, Ordering::SeqCst),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
            }
        });
        rx
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn new_conversation(&self, history: &Transcript, profile: &ConversationProfile) -> Conversation {
        Conversation::new(history, ConversationOptions::from_profile(profile, 4096))
    }

    async fn prepare(&self) -> Result<(), ApiError> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.prepare_delay).await;
        Ok(())
    }

    async fn submit(
        &self,
        _conversation: &Conversation,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(user_text.to_string());
        Ok(self.play(cancel))
    }

    async fn regenerate(
        &self,
        conversation: &Conversation,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError> {
        self.regenerates.fetch_add(1, Ordering::SeqCst);
        conversation.prompt_for_regenerate()?;
        Ok(self.play(cancel))
    }

    fn has_gpu_support(&self) -> bool {
        self.gpu
    }
}

/// Returns fixed partitions and records the requested `top_k`.
#[derive(Default)]
pub struct FixedRetriever {
    partitions: Vec<PartitionSimilarity>,
    pub lookups: Mutex<Vec<usize>>,
}

impl FixedRetriever {
    pub fn new(partitions: Vec<PartitionSimilarity>) -> Arc<Self> {
        Arc::new(Self {
            partitions,
            lookups: Mutex::new(Vec::new()),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Retriever for FixedRetriever {
    async fn find_matching_partitions(
        &self,
        _query: &str,
        top_k: usize,
        _force_unique_section: bool,
    ) -> Result<Vec<PartitionSimilarity>, ApiError> {
        self.lookups.lock().unwrap().push(top_k);
        Ok(self.partitions.iter().take(top_k).cloned().collect())
    }
}

pub fn partition(section: &str, text: &str) -> PartitionSimilarity {
    PartitionSimilarity {
        collection: "Ebooks".to_string(),
        point_id: "1".to_string(),
        section: section.to_string(),
        partition_index: 0,
        text: text.to_string(),
        score: 0.9,
    }
}

/// Counts writes on top of an in-memory cache.
#[derive(Default)]
pub struct CountingCache {
    inner: MemorySessionCache,
    pub saves: AtomicUsize,
}

impl CountingCache {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionCache for CountingCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ApiError> {
        self.inner.get_raw(key).await
    }

    async fn set_raw(&self, key: &str, value: &str) -> Result<(), ApiError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.set_raw(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), ApiError> {
        self.inner.remove(key).await
    }
}

pub struct FailingCache;

#[async_trait]
impl SessionCache for FailingCache {
    async fn get_raw(&self, _key: &str) -> Result<Option<String>, ApiError> {
        Err(ApiError::store("connection refused"))
    }

    async fn set_raw(&self, _key: &str, _value: &str) -> Result<(), ApiError> {
        Err(ApiError::store("connection refused"))
    }

    async fn remove(&self, _key: &str) -> Result<(), ApiError> {
        Err(ApiError::store("connection refused"))
    }
}

pub struct Harness {
    pub engine: Arc<ScriptedEngine>,
    pub cache: Arc<CountingCache>,
    pub history: HistoryStore,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self::with_engine(ScriptedEngine::new(scripts))
    }

    pub fn with_engine(engine: Arc<ScriptedEngine>) -> Self {
        let cache = Arc::new(CountingCache::default());
        Self {
            engine,
            history: HistoryStore::new(cache.clone()),
            cache,
        }
    }

    pub fn assistant(&self) -> ChatOrchestrator {
        self.assistant_with(ChatSettings::default())
    }

    pub fn assistant_with(&self, settings: ChatSettings) -> ChatOrchestrator {
        ChatOrchestrator::new(
            self.history.clone(),
            self.engine.clone(),
            ConversationProfile::assistant(),
            settings,
        )
    }

    pub fn agent(&self, retriever: Arc<FixedRetriever>) -> ChatOrchestrator {
        self.agent_with(retriever, ChatSettings::default())
    }

    pub fn agent_with(&self, retriever: Arc<FixedRetriever>, settings: ChatSettings) -> ChatOrchestrator {
        ChatOrchestrator::new(
            self.history.clone(),
            self.engine.clone(),
            ConversationProfile::agent(),
            settings,
        )
        .with_retriever(retriever, RetrievalPolicy::default())
    }
}
