//! Relational fallback store: one `embeddings` row per collection holding
//! the JSON array of its points. Search is brute-force cosine similarity.

use std::cmp::Ordering;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use super::point::{Metadata, PointEntry, PointId, ScoredPoint};
use super::store::{
    cosine_similarity, require_collection, require_limit, require_vector, require_vector_size,
    VectorStore,
};
use crate::core::errors::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    id: String,
    #[serde(default)]
    payload: Metadata,
    vector: Vec<f32>,
}

impl StoredPoint {
    fn to_entry(&self, with_vector: bool, with_metadata: bool) -> PointEntry {
        PointEntry {
            id: self.id.clone(),
            vector: if with_vector {
                self.vector.clone()
            } else {
                Vec::new()
            },
            metadata: if with_metadata {
                self.payload.clone()
            } else {
                Metadata::new()
            },
        }
    }
}

struct CollectionRow {
    vector_size: usize,
    points: Vec<StoredPoint>,
}

pub struct SqlVectorStore {
    pool: SqlitePool,
    // Serializes read-modify-write cycles on the points column.
    write_lock: Mutex<()>,
}

impl SqlVectorStore {
    pub async fn with_path(db_path: PathBuf) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(ApiError::store)?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        tracing::info!(path = %db_path.display(), "Embedding store database ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS embeddings (
                collection TEXT PRIMARY KEY,
                vector_size INTEGER NOT NULL,
                points TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::store)?;
        Ok(())
    }

    async fn load(&self, collection: &str) -> Result<Option<CollectionRow>, ApiError> {
        let row = sqlx::query("SELECT vector_size, points FROM embeddings WHERE collection = ?1")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::store)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let vector_size: i64 = row.try_get("vector_size").map_err(ApiError::store)?;
        let raw_points: String = row.try_get("points").map_err(ApiError::store)?;
        let points: Vec<StoredPoint> = serde_json::from_str(&raw_points).map_err(|e| {
            ApiError::Internal(format!(
                "Stored points for collection '{}' are not readable: {}",
                collection, e
            ))
        })?;

        Ok(Some(CollectionRow {
            vector_size: vector_size.max(0) as usize,
            points,
        }))
    }

    async fn load_existing(&self, collection: &str) -> Result<CollectionRow, ApiError> {
        self.load(collection)
            .await?
            .ok_or_else(|| missing_collection(collection))
    }

    async fn store_points(&self, collection: &str, points: &[StoredPoint]) -> Result<(), ApiError> {
        let encoded = serde_json::to_string(points).map_err(ApiError::internal)?;
        let now = chrono::Utc::now().to_rfc3339();
        let result =
            sqlx::query("UPDATE embeddings SET points = ?1, updated_at = ?2 WHERE collection = ?3")
                .bind(&encoded)
                .bind(&now)
                .bind(collection)
                .execute(&self.pool)
                .await
                .map_err(ApiError::store)?;

        if result.rows_affected() != 1 {
            return Err(ApiError::BackendRejected(format!(
                "Failed to write points for collection '{}'",
                collection
            )));
        }
        Ok(())
    }
}

fn missing_collection(collection: &str) -> ApiError {
    ApiError::NotFound(format!("Collection '{}' does not exist.", collection))
}

fn missing_point(collection: &str, id: &str) -> ApiError {
    ApiError::NotFound(format!("{} with id {} not found", collection, id))
}

#[async_trait]
impl VectorStore for SqlVectorStore {
    async fn collection_exists(&self, collection: &str) -> Result<bool, ApiError> {
        require_collection(collection)?;
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM embeddings WHERE collection = ?1")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await
                .map_err(ApiError::store)?;
        Ok(found.is_some())
    }

    async fn create_collection(&self, collection: &str, vector_size: usize) -> Result<(), ApiError> {
        require_collection(collection)?;
        require_vector_size(vector_size)?;

        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO embeddings (collection, vector_size, points, updated_at)
             VALUES (?1, ?2, '[]', ?3)
             ON CONFLICT(collection) DO NOTHING",
        )
        .bind(collection)
        .bind(vector_size as i64)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(ApiError::store)?;
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), ApiError> {
        require_collection(collection)?;
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM embeddings WHERE collection = ?1")
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(ApiError::store)?;
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> Result<(), ApiError> {
        require_collection(collection)?;
        let id = PointId::parse(id)?.to_string();
        require_vector(&vector)?;

        let _guard = self.write_lock.lock().await;
        let mut row = self.load_existing(collection).await?;
        if vector.len() != row.vector_size {
            return Err(ApiError::BadRequest(format!(
                "Vector size {} does not match collection size {}.",
                vector.len(),
                row.vector_size
            )));
        }

        let point = StoredPoint {
            id,
            payload: metadata,
            vector,
        };
        match row.points.iter_mut().find(|p| p.id == point.id) {
            Some(existing) => *existing = point,
            None => row.points.push(point),
        }

        self.store_points(collection, &row.points).await
    }

    async fn get_metadata(&self, collection: &str, id: &str) -> Result<Metadata, ApiError> {
        require_collection(collection)?;
        let key = PointId::parse(id)?.to_string();
        let row = self.load_existing(collection).await?;
        row.points
            .into_iter()
            .find(|p| p.id == key)
            .map(|p| p.payload)
            .ok_or_else(|| missing_point(collection, id))
    }

    async fn retrieve_from_metadata(
        &self,
        collection: &str,
        filter: &Metadata,
        with_vector: bool,
        with_metadata: bool,
    ) -> Result<Vec<PointEntry>, ApiError> {
        require_collection(collection)?;
        let row = self.load_existing(collection).await?;
        Ok(row
            .points
            .iter()
            .filter(|p| p.payload.contains_all(filter))
            .map(|p| p.to_entry(with_vector, with_metadata))
            .collect())
    }

    async fn search_similar(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        with_vector: bool,
        with_metadata: bool,
    ) -> Result<Vec<ScoredPoint>, ApiError> {
        require_collection(collection)?;
        require_vector(vector)?;
        require_limit(limit)?;

        let row = self.load_existing(collection).await?;
        let mut scored: Vec<ScoredPoint> = row
            .points
            .iter()
            .map(|p| ScoredPoint {
                point: p.to_entry(with_vector, with_metadata),
                score: cosine_similarity(vector, &p.vector),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn update_metadata(
        &self,
        collection: &str,
        id: &str,
        metadata: Metadata,
        clear_first: bool,
    ) -> Result<(), ApiError> {
        require_collection(collection)?;
        let key = PointId::parse(id)?.to_string();

        let _guard = self.write_lock.lock().await;
        let mut row = self.load_existing(collection).await?;
        let point = row
            .points
            .iter_mut()
            .find(|p| p.id == key)
            .ok_or_else(|| missing_point(collection, id))?;

        if clear_first {
            point.payload = metadata;
        } else {
            point.payload.merge(&metadata);
        }

        self.store_points(collection, &row.points).await
    }

    async fn delete_from_metadata(&self, collection: &str, filter: &Metadata) -> Result<(), ApiError> {
        require_collection(collection)?;

        let _guard = self.write_lock.lock().await;
        let mut row = self.load_existing(collection).await?;
        let before = row.points.len();
        row.points.retain(|p| !p.payload.contains_all(filter));
        if row.points.len() == before {
            return Ok(());
        }

        self.store_points(collection, &row.points).await
    }
}
