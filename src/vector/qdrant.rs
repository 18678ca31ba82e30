//! Qdrant backend over its REST API.
//!
//! Every write is sent with `wait=true` and must come back `completed`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::point::{Metadata, PointEntry, PointId, ScoredPoint};
use super::store::{
    require_collection, require_limit, require_vector, require_vector_size, VectorStore,
};
use crate::core::errors::ApiError;

const SCROLL_PAGE_SIZE: usize = 256;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ExistsResult {
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateResult {
    status: String,
}

#[derive(Debug, Deserialize)]
struct QdrantPoint {
    id: PointId,
    #[serde(default)]
    payload: Option<Metadata>,
    #[serde(default)]
    vector: Option<Value>,
    #[serde(default)]
    score: Option<f32>,
}

impl QdrantPoint {
    fn into_entry(self) -> PointEntry {
        // Named-vector collections return an object; only plain vectors are read.
        let vector = match self.vector {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect(),
            _ => Vec::new(),
        };
        PointEntry {
            id: self.id.to_string(),
            vector,
            metadata: self.payload.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<QdrantPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ApiError::internal)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    fn url(&self, collection: &str, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.base_url,
            urlencoding::encode(collection),
            suffix
        )
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::store(format!("Qdrant request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::NotFound(format!("Qdrant: {}", body.trim())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::BackendRejected(format!(
                "Qdrant returned {}: {}",
                status,
                body.trim()
            )));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ApiError::BackendRejected(format!("Invalid Qdrant response: {}", e)))?;
        envelope
            .result
            .ok_or_else(|| ApiError::BackendRejected("Qdrant response has no result".to_string()))
    }

    async fn send_update(&self, builder: RequestBuilder, action: &str) -> Result<(), ApiError> {
        let result: UpdateResult = self.send(builder).await?;
        if result.status != "completed" {
            return Err(ApiError::BackendRejected(format!(
                "Failed to {} (status: {})",
                action, result.status
            )));
        }
        Ok(())
    }
}

fn filter_body(filter: &Metadata) -> Value {
    let must: Vec<Value> = filter
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    json!({ "must": must })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn collection_exists(&self, collection: &str) -> Result<bool, ApiError> {
        require_collection(collection)?;
        let result: ExistsResult = self
            .send(self.request(Method::GET, self.url(collection, "/exists")))
            .await?;
        Ok(result.exists)
    }

    async fn create_collection(&self, collection: &str, vector_size: usize) -> Result<(), ApiError> {
        require_collection(collection)?;
        require_vector_size(vector_size)?;
        if self.collection_exists(collection).await? {
            return Ok(());
        }

        let body = json!({ "vectors": { "size": vector_size, "distance": "Cosine" } });
        let created: bool = self
            .send(self.request(Method::PUT, self.url(collection, "")).json(&body))
            .await?;
        if !created {
            return Err(ApiError::BackendRejected(format!(
                "Failed to create collection '{}'",
                collection
            )));
        }
        tracing::info!(collection, vector_size, "Created Qdrant collection");
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), ApiError> {
        require_collection(collection)?;
        let _: bool = self
            .send(self.request(Method::DELETE, self.url(collection, "")))
            .await?;
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
        let point_id = PointId::parse(id)?;
        require_vector(&vector)?;

        let body = json!({
            "points": [{ "id": point_id, "vector": vector, "payload": metadata }]
        });
        self.send_update(
            self.request(Method::PUT, self.url(collection, "/points?wait=true"))
                .json(&body),
            &format!("upsert vector for collection '{}' with id {}", collection, id),
        )
        .await
    }

    async fn get_metadata(&self, collection: &str, id: &str) -> Result<Metadata, ApiError> {
        require_collection(collection)?;
        let point_id = PointId::parse(id)?;

        let body = json!({ "ids": [point_id], "with_payload": true, "with_vector": false });
        let points: Vec<QdrantPoint> = self
            .send(self.request(Method::POST, self.url(collection, "/points")).json(&body))
            .await?;

        points
            .into_iter()
            .next()
            .map(|p| p.payload.unwrap_or_default())
            .ok_or_else(|| ApiError::NotFound(format!("{} with id {} not found", collection, id)))
    }

    async fn retrieve_from_metadata(
        &self,
        collection: &str,
        filter: &Metadata,
        with_vector: bool,
        with_metadata: bool,
    ) -> Result<Vec<PointEntry>, ApiError> {
        require_collection(collection)?;

        let mut entries = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let mut body = json!({
                "filter": filter_body(filter),
                "limit": SCROLL_PAGE_SIZE,
                "with_payload": with_metadata,
                "with_vector": with_vector,
            });
            if let Some(next) = offset.take() {
                body["offset"] = next;
            }

            let page: ScrollResult = self
                .send(
                    self.request(Method::POST, self.url(collection, "/points/scroll"))
                        .json(&body),
                )
                .await?;
            entries.extend(page.points.into_iter().map(QdrantPoint::into_entry));

            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        Ok(entries)
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

        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": with_metadata,
            "with_vector": with_vector,
        });
        let points: Vec<QdrantPoint> = self
            .send(
                self.request(Method::POST, self.url(collection, "/points/search"))
                    .json(&body),
            )
            .await?;

        Ok(points
            .into_iter()
            .map(|p| {
                let score = p.score.unwrap_or_default();
                ScoredPoint {
                    point: p.into_entry(),
                    score,
                }
            })
            .collect())
    }

    async fn update_metadata(
        &self,
        collection: &str,
        id: &str,
        metadata: Metadata,
        clear_first: bool,
    ) -> Result<(), ApiError> {
        require_collection(collection)?;
        let point_id = PointId::parse(id)?;

        if clear_first {
            self.send_update(
                self.request(
                    Method::POST,
                    self.url(collection, "/points/payload/clear?wait=true"),
                )
                .json(&json!({ "points": [point_id] })),
                &format!("clear metadata for collection '{}' with id {}", collection, id),
            )
            .await?;
        }

        self.send_update(
            self.request(Method::POST, self.url(collection, "/points/payload?wait=true"))
                .json(&json!({ "payload": metadata, "points": [point_id] })),
            &format!("update metadata for collection '{}' with id {}", collection, id),
        )
        .await
    }

    async fn delete_from_metadata(&self, collection: &str, filter: &Metadata) -> Result<(), ApiError> {
        require_collection(collection)?;
        self.send_update(
            self.request(Method::POST, self.url(collection, "/points/delete?wait=true"))
                .json(&json!({ "filter": filter_body(filter) })),
            &format!("delete vectors from collection '{}'", collection),
        )
        .await
    }
}
