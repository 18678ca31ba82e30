use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::errors::ApiError;

/// Key/value cache holding serialized transcripts.
///
/// Any I/O failure must surface as `ApiError::StoreUnavailable`.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ApiError>;

    /// Overwrites any previous value.
    async fn set_raw(&self, key: &str, value: &str) -> Result<(), ApiError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), ApiError>;
}

/// In-process cache; contents are lost on restart.
#[derive(Default)]
pub struct MemorySessionCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ApiError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: &str) -> Result<(), ApiError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ApiError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
