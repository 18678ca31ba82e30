use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::chunking::TextChunking;
use super::engine::{PartitionSimilarity, RagEngine, Retriever};
use crate::core::errors::ApiError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Imports every file of `dir` into `collection`, one section per file
/// stem. Sections already present are left alone; a missing directory
/// imports nothing.
pub async fn import_source_dir(
    engine: &RagEngine,
    dir: &Path,
    collection: &str,
    chunking: &TextChunking,
) -> Result<ImportSummary, ApiError> {
    let source = engine.add_data_source(collection);
    let mut summary = ImportSummary::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(dir = %dir.display(), "Source directory not found, nothing to import");
            return Ok(summary);
        }
        Err(e) => return Err(ApiError::internal(e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(ApiError::internal)? {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let Some(section) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        if source.has_section(section).await? {
            tracing::debug!(section, "Section already imported");
            summary.skipped += 1;
            continue;
        }

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable source file");
                summary.skipped += 1;
                continue;
            }
        };

        engine.import_text(&text, chunking, collection, section).await?;
        summary.imported += 1;
    }

    tracing::info!(
        collection,
        imported = summary.imported,
        skipped = summary.skipped,
        "Source import finished"
    );
    Ok(summary)
}

/// Imports a source directory at most once and retries after a failed
/// attempt.
///
/// Retrieval runs the import first, so sources still get imported when the
/// start-up attempt failed because the models were not available yet.
pub struct SourceImport {
    engine: Arc<RagEngine>,
    dir: PathBuf,
    collection: String,
    chunking: TextChunking,
    done: OnceCell<ImportSummary>,
}

impl SourceImport {
    pub fn new(
        engine: Arc<RagEngine>,
        dir: PathBuf,
        collection: impl Into<String>,
        chunking: TextChunking,
    ) -> Self {
        Self {
            engine,
            dir,
            collection: collection.into(),
            chunking,
            done: OnceCell::new(),
        }
    }

    /// Runs the import unless an earlier call completed it. Concurrent
    /// callers wait on the same attempt.
    pub async fn ensure_imported(&self) -> Result<ImportSummary, ApiError> {
        self.done
            .get_or_try_init(|| {
                import_source_dir(&self.engine, &self.dir, &self.collection, &self.chunking)
            })
            .await
            .copied()
    }

    pub fn is_imported(&self) -> bool {
        self.done.initialized()
    }
}

#[async_trait]
impl Retriever for SourceImport {
    async fn find_matching_partitions(
        &self,
        query: &str,
        top_k: usize,
        force_unique_section: bool,
    ) -> Result<Vec<PartitionSimilarity>, ApiError> {
        if let Err(e) = self.ensure_imported().await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Source import failed, searching what is stored");
        }
        self.engine
            .find_matching_partitions(query, top_k, force_unique_section)
            .await
    }
}
