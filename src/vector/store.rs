use async_trait::async_trait;

use super::point::{Metadata, PointEntry, ScoredPoint};
use crate::core::errors::ApiError;

/// Collection and point operations shared by every embedding backend.
///
/// Writes return only after the backend has acknowledged them.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, collection: &str) -> Result<bool, ApiError>;

    /// Creating a collection that already exists is a no-op.
    async fn create_collection(&self, collection: &str, vector_size: usize)
        -> Result<(), ApiError>;

    async fn delete_collection(&self, collection: &str) -> Result<(), ApiError>;

    /// Inserts the point or replaces the one with the same id.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> Result<(), ApiError>;

    async fn get_metadata(&self, collection: &str, id: &str) -> Result<Metadata, ApiError>;

    /// Points whose metadata contains every pair of `filter`.
    async fn retrieve_from_metadata(
        &self,
        collection: &str,
        filter: &Metadata,
        with_vector: bool,
        with_metadata: bool,
    ) -> Result<Vec<PointEntry>, ApiError>;

    /// Nearest points by descending similarity, as ranked by the backend.
    async fn search_similar(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        with_vector: bool,
        with_metadata: bool,
    ) -> Result<Vec<ScoredPoint>, ApiError>;

    /// Replaces the metadata when `clear_first`, merges it otherwise.
    async fn update_metadata(
        &self,
        collection: &str,
        id: &str,
        metadata: Metadata,
        clear_first: bool,
    ) -> Result<(), ApiError>;

    async fn delete_from_metadata(&self, collection: &str, filter: &Metadata)
        -> Result<(), ApiError>;
}

pub(crate) fn require_collection(collection: &str) -> Result<(), ApiError> {
    if collection.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Collection identifier cannot be empty.".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn require_vector(vector: &[f32]) -> Result<(), ApiError> {
    if vector.is_empty() {
        return Err(ApiError::BadRequest(
            "Vector data cannot be empty.".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn require_vector_size(vector_size: usize) -> Result<(), ApiError> {
    if vector_size == 0 {
        return Err(ApiError::BadRequest(
            "Vector size must be greater than zero.".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn require_limit(limit: usize) -> Result<(), ApiError> {
    if limit == 0 {
        return Err(ApiError::BadRequest(
            "Limit must be greater than zero.".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}
