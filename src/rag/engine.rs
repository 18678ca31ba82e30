//! Document import and similarity search over embedded partitions.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::chunking::TextChunking;
use super::context::compose_grounded_prompt;
use crate::core::errors::ApiError;
use crate::llm::{Conversation, Embedder, GenerationEngine, TokenStream};
use crate::vector::{Metadata, VectorStore};

pub const SECTION_KEY: &str = "section";
pub const PARTITION_KEY: &str = "partition";
pub const TEXT_KEY: &str = "text";

// Candidates fetched per requested partition when sections must be unique.
const UNIQUE_SECTION_POOL: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSimilarity {
    pub collection: String,
    pub point_id: String,
    pub section: String,
    pub partition_index: usize,
    pub text: String,
    pub score: f32,
}

/// A collection attached to the engine.
#[derive(Clone)]
pub struct DataSource {
    collection: String,
    store: Arc<dyn VectorStore>,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl DataSource {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn has_section(&self, section: &str) -> Result<bool, ApiError> {
        if !self.store.collection_exists(&self.collection).await? {
            return Ok(false);
        }
        let filter = Metadata::new().with(SECTION_KEY, section);
        let points = self
            .store
            .retrieve_from_metadata(&self.collection, &filter, false, false)
            .await?;
        Ok(!points.is_empty())
    }
}

pub struct RagEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    sources: RwLock<Vec<DataSource>>,
    min_relevance_score: f32,
}

impl RagEngine {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            sources: RwLock::new(Vec::new()),
            min_relevance_score: 0.5,
        }
    }

    pub fn with_min_relevance(mut self, score: f32) -> Self {
        self.min_relevance_score = score;
        self
    }

    /// Attaches a collection for search; attaching it twice is a no-op.
    pub fn add_data_source(&self, collection: &str) -> DataSource {
        let mut sources = self.sources.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = sources.iter().find(|s| s.collection == collection) {
            return existing.clone();
        }
        let source = DataSource {
            collection: collection.to_string(),
            store: self.store.clone(),
        };
        sources.push(source.clone());
        source
    }

    pub fn try_get_data_source(&self, collection: &str) -> Option<DataSource> {
        let sources = self.sources.read().unwrap_or_else(|p| p.into_inner());
        sources.iter().find(|s| s.collection == collection).cloned()
    }

    pub fn clear_data_sources(&self) {
        let mut sources = self.sources.write().unwrap_or_else(|p| p.into_inner());
        sources.clear();
    }

    fn data_sources(&self) -> Vec<DataSource> {
        let sources = self.sources.read().unwrap_or_else(|p| p.into_inner());
        sources.clone()
    }

    /// Chunks, embeds and stores `text` as `section` of `collection`,
    /// creating the collection on first use.
    pub async fn import_text(
        &self,
        text: &str,
        chunking: &TextChunking,
        collection: &str,
        section: &str,
    ) -> Result<DataSource, ApiError> {
        let source = self.add_data_source(collection);
        let chunks = chunking.split(text);
        if chunks.is_empty() {
            tracing::warn!(collection, section, "Nothing to import, text is empty");
            return Ok(source);
        }

        let vectors = self.embedder.embed(&chunks).await?;
        if vectors.len() != chunks.len() {
            return Err(ApiError::internal(format!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        if !self.store.collection_exists(collection).await? {
            let size = vectors.first().map(Vec::len).unwrap_or_default();
            self.store.create_collection(collection, size).await?;
        }

        if let Err(err) = self.store_partitions(collection, section, &chunks, vectors).await {
            // A partial section would pass `has_section` and never be completed.
            let filter = Metadata::new().with(SECTION_KEY, section);
            if let Err(cleanup) = self.store.delete_from_metadata(collection, &filter).await {
                tracing::warn!(collection, section, error = %cleanup, "Failed to remove partially imported section");
            }
            return Err(err);
        }

        tracing::info!(collection, section, partitions = chunks.len(), "Imported section");
        Ok(source)
    }

    async fn store_partitions(
        &self,
        collection: &str,
        section: &str,
        chunks: &[String],
        vectors: Vec<Vec<f32>>,
    ) -> Result<(), ApiError> {
        for (index, (chunk, vector)) in chunks.iter().zip(vectors).enumerate() {
            let metadata = Metadata::new()
                .with(SECTION_KEY, section)
                .with(PARTITION_KEY, index.to_string())
                .with(TEXT_KEY, chunk.as_str());
            let id = uuid::Uuid::new_v4().to_string();
            self.store.upsert(collection, &id, vector, metadata).await?;
        }
        Ok(())
    }

    /// Up to `top_k` partitions above the relevance threshold across every
    /// attached collection, best first. Collections that do not exist yet
    /// are skipped.
    pub async fn find_matching_partitions(
        &self,
        query: &str,
        top_k: usize,
        force_unique_section: bool,
    ) -> Result<Vec<PartitionSimilarity>, ApiError> {
        let sources = self.data_sources();
        if top_k == 0 || sources.is_empty() || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::internal("Embedder returned no vector for the query"))?;

        let limit = if force_unique_section {
            top_k * UNIQUE_SECTION_POOL
        } else {
            top_k
        };

        let mut matches = Vec::new();
        for source in sources {
            if !self.store.collection_exists(&source.collection).await? {
                tracing::debug!(collection = %source.collection, "Collection not created yet, skipping");
                continue;
            }
            let hits = self
                .store
                .search_similar(&source.collection, &query_vector, limit, false, true)
                .await?;
            matches.extend(hits.into_iter().map(|hit| {
                let metadata = &hit.point.metadata;
                PartitionSimilarity {
                    collection: source.collection.clone(),
                    section: metadata.get(SECTION_KEY).unwrap_or_default().to_string(),
                    partition_index: metadata
                        .get(PARTITION_KEY)
                        .and_then(|p| p.parse().ok())
                        .unwrap_or_default(),
                    text: metadata.get(TEXT_KEY).unwrap_or_default().to_string(),
                    point_id: hit.point.id,
                    score: hit.score,
                }
            }));
        }

        matches.retain(|m| m.score >= self.min_relevance_score);
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        if force_unique_section {
            let mut seen = HashSet::new();
            matches.retain(|m| seen.insert((m.collection.clone(), m.section.clone())));
        }
        matches.truncate(top_k);
        Ok(matches)
    }
}

/// Retrieval capability consumed by the orchestrator.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn find_matching_partitions(
        &self,
        query: &str,
        top_k: usize,
        force_unique_section: bool,
    ) -> Result<Vec<PartitionSimilarity>, ApiError>;

    /// Streams an answer to `query` grounded in `partitions`, under the
    /// conversation's own system prompt.
    async fn query_partitions(
        &self,
        query: &str,
        partitions: &[PartitionSimilarity],
        conversation: &Conversation,
        engine: &dyn GenerationEngine,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError> {
        let prompt = compose_grounded_prompt(query, partitions);
        engine.submit(conversation, &prompt, cancel).await
    }
}

#[async_trait]
impl Retriever for RagEngine {
    async fn find_matching_partitions(
        &self,
        query: &str,
        top_k: usize,
        force_unique_section: bool,
    ) -> Result<Vec<PartitionSimilarity>, ApiError> {
        RagEngine::find_matching_partitions(self, query, top_k, force_unique_section).await
    }
}
