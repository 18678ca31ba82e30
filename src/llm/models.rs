use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;

use crate::core::config::settings::ModelSpec;
use crate::core::errors::ApiError;

pub type ProgressCallback<'a> = &'a (dyn Fn(f32, &str) + Sync);

/// Resolves model files under a local directory, downloading them when
/// they are missing.
#[derive(Clone)]
pub struct ModelLoader {
    client: Client,
    models_dir: PathBuf,
}

impl ModelLoader {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            client: Client::new(),
            models_dir,
        }
    }

    pub fn local_path(&self, spec: &ModelSpec) -> Result<PathBuf, ApiError> {
        let file_name = model_file_name(spec)?;
        let candidate = PathBuf::from(&file_name);
        if candidate.is_absolute() {
            return Ok(candidate);
        }
        Ok(self.models_dir.join(candidate))
    }

    /// Path of the model on disk. The local file wins; otherwise the model
    /// is downloaded from `spec.uri`.
    pub async fn ensure_local(
        &self,
        spec: &ModelSpec,
        progress_cb: Option<ProgressCallback<'_>>,
    ) -> Result<PathBuf, ApiError> {
        let target_path = self.local_path(spec)?;
        if target_path.exists() {
            tracing::info!(path = %target_path.display(), "Using local model");
            return Ok(target_path);
        }

        let Some(uri) = spec.uri.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Err(ApiError::BadRequest(format!(
                "Model file {} is missing and no URI is set.",
                target_path.display()
            )));
        };

        self.download(uri, &target_path, progress_cb).await?;
        Ok(target_path)
    }

    async fn download(
        &self,
        uri: &str,
        target_path: &Path,
        progress_cb: Option<ProgressCallback<'_>>,
    ) -> Result<(), ApiError> {
        if let Some(parent) = target_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ApiError::internal)?;
        }

        tracing::info!(uri, path = %target_path.display(), "Downloading model");
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| ApiError::ServiceUnavailable(format!("Model download failed: {}", e)))?
            .error_for_status()
            .map_err(|e| ApiError::ServiceUnavailable(format!("Model download failed: {}", e)))?;

        let total = response.content_length().unwrap_or(0);
        let mut stream = response.bytes_stream();

        let part_path = target_path.with_extension("part");
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(ApiError::internal)?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let data = chunk.map_err(|e| {
                ApiError::ServiceUnavailable(format!("Model download interrupted: {}", e))
            })?;
            file.write_all(&data).await.map_err(ApiError::internal)?;
            downloaded += data.len() as u64;
            if let Some(cb) = progress_cb {
                let progress = if total > 0 {
                    downloaded as f32 / total as f32
                } else {
                    0.0
                };
                cb(progress, "Downloading model...");
            }
        }

        file.flush().await.map_err(ApiError::internal)?;
        drop(file);
        tokio::fs::rename(&part_path, target_path)
            .await
            .map_err(ApiError::internal)?;

        tracing::info!(path = %target_path.display(), bytes = downloaded, "Model downloaded");
        Ok(())
    }
}

/// File name from `spec.name`, else the last path segment of `spec.uri`.
fn model_file_name(spec: &ModelSpec) -> Result<String, ApiError> {
    let name = spec.name.trim();
    if !name.is_empty() {
        return Ok(name.to_string());
    }

    let from_uri = spec
        .uri
        .as_deref()
        .map(|uri| uri.split(['?', '#']).next().unwrap_or_default())
        .and_then(|path| path.rsplit('/').next())
        .map(str::trim)
        .filter(|segment| !segment.is_empty());

    from_uri
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("Model name and URI is not set.".to_string()))
}

/// Progress callback that logs each time another tenth is reached.
pub fn progress_logger(label: &'static str) -> impl Fn(f32, &str) + Sync {
    let last_decile = AtomicU32::new(0);
    move |progress: f32, stage: &str| {
        let decile = (progress.clamp(0.0, 1.0) * 10.0).floor() as u32;
        if decile > last_decile.fetch_max(decile, Ordering::Relaxed) {
            tracing::info!(model = label, percent = decile * 10, "{}", stage);
        }
    }
}
