pub mod point;
pub mod qdrant;
pub mod sql;
pub mod store;

use std::sync::Arc;

pub use point::{Metadata, PointEntry, PointId, ScoredPoint};
pub use qdrant::QdrantStore;
pub use sql::SqlVectorStore;
pub use store::VectorStore;

use crate::core::config::settings::StorageSettings;
use crate::core::config::AppPaths;
use crate::core::errors::ApiError;

/// Qdrant when `storage.qdrant_url` is set, the SQLite table store otherwise.
pub async fn connect_vector_store(
    storage: &StorageSettings,
    paths: &AppPaths,
) -> Result<Arc<dyn VectorStore>, ApiError> {
    if let Some(url) = storage.qdrant_url() {
        tracing::info!(url, "Using Qdrant vector store");
        let store = QdrantStore::new(url, storage.qdrant_api_key.clone())?;
        return Ok(Arc::new(store));
    }

    let db_path = paths.resolve(&storage.embeddings_db);
    tracing::info!(path = %db_path.display(), "Using SQLite vector store");
    let store = SqlVectorStore::with_path(db_path).await?;
    Ok(Arc::new(store))
}
