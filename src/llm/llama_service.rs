//! Supervises a `llama-server` child process and talks to its HTTP API.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::config::AppPaths;
use crate::core::errors::ApiError;
use crate::llm::types::{CompletionRequest, TokenStream};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlamaServerConfig {
    pub model_path: PathBuf,
    pub port: u16,
    pub context_size: usize,
    pub n_gpu_layers: i32,
    pub embedding: bool,
}

#[derive(Clone)]
pub struct LlamaServer {
    label: &'static str,
    server_path: PathBuf,
    inner: Arc<Mutex<ServerProcess>>,
    client: Client,
}

#[derive(Default)]
struct ServerProcess {
    child: Option<Child>,
    config: Option<LlamaServerConfig>,
}

impl LlamaServer {
    pub fn new(label: &'static str, server_path: PathBuf) -> Self {
        Self {
            label,
            server_path,
            inner: Arc::new(Mutex::new(ServerProcess::default())),
            client: Client::new(),
        }
    }

    pub fn find_server_binary(paths: &AppPaths, configured: Option<&str>) -> PathBuf {
        if let Some(configured) = configured.map(str::trim).filter(|p| !p.is_empty()) {
            return paths.resolve(configured);
        }

        let candidates = [
            paths.project_root.join("bin/llama-server.exe"),
            paths.project_root.join("bin/llama-server"),
            PathBuf::from("llama-server"),
        ];
        for path in candidates {
            if path.exists() || which::which(&path).is_ok() {
                return path;
            }
        }
        PathBuf::from("llama-server")
    }

    /// Starts the server for `config` unless it already runs with it.
    /// A process that has exited since the last call is restarted.
    pub async fn ensure_running(&self, config: &LlamaServerConfig) -> Result<(), ApiError> {
        let mut process = self.inner.lock().await;

        if let Some(child) = process.child.as_mut() {
            let alive = matches!(child.try_wait(), Ok(None));
            if alive && process.config.as_ref() == Some(config) {
                return Ok(());
            }
            if !alive {
                tracing::warn!(server = self.label, "llama-server exited, restarting");
            }
            Self::stop_internal(&mut process).await;
        }

        self.start_internal(&mut process, config).await
    }

    async fn start_internal(
        &self,
        process: &mut ServerProcess,
        config: &LlamaServerConfig,
    ) -> Result<(), ApiError> {
        let mut cmd = Command::new(&self.server_path);
        cmd.arg("-m").arg(&config.model_path);
        cmd.arg("--host").arg("127.0.0.1");
        cmd.arg("--port").arg(config.port.to_string());
        cmd.arg("-c").arg(config.context_size.to_string());
        if config.n_gpu_layers >= 0 {
            cmd.arg("-ngl").arg(config.n_gpu_layers.to_string());
        }
        if config.embedding {
            cmd.arg("--embedding");
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ApiError::ServiceUnavailable(format!(
                "Failed to spawn llama-server ({}): {}",
                self.server_path.display(),
                e
            ))
        })?;

        let label = self.label;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("[{}] {}", label, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("[{}-err] {}", label, line);
                }
            });
        }

        tracing::info!(
            server = self.label,
            model = %config.model_path.display(),
            port = config.port,
            "Starting llama-server"
        );

        self.wait_for_health(config.port, &mut child).await?;
        process.child = Some(child);
        process.config = Some(config.clone());
        tracing::info!(server = self.label, "llama-server is ready");
        Ok(())
    }

    async fn stop_internal(process: &mut ServerProcess) {
        if let Some(mut child) = process.child.take() {
            let _ = child.kill().await;
        }
        process.config = None;
    }

    pub async fn shutdown(&self) {
        let mut process = self.inner.lock().await;
        Self::stop_internal(&mut process).await;
    }

    // `/health` answers 503 while the model is loading; callers bound the wait.
    async fn wait_for_health(&self, port: u16, child: &mut Child) -> Result<(), ApiError> {
        let url = format!("http://127.0.0.1:{}/health", port);
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ApiError::ServiceUnavailable(format!(
                    "llama-server exited during startup ({})",
                    status
                )));
            }
            if let Ok(res) = self.client.get(&url).send().await {
                if res.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn base_url(&self) -> Result<String, ApiError> {
        let process = self.inner.lock().await;
        let port = process
            .config
            .as_ref()
            .map(|c| c.port)
            .ok_or_else(|| ApiError::ServiceUnavailable(format!("{} is not running", self.label)))?;
        Ok(format!("http://127.0.0.1:{}", port))
    }

    /// Streams a completion. When the server reports the end of the
    /// reply, `end_marker` is sent as the final chunk.
    pub async fn stream_completion(
        &self,
        request: CompletionRequest,
        end_marker: &'static str,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ApiError> {
        let url = format!("{}/completion", self.base_url().await?);

        let mut body = json!({
            "prompt": request.prompt,
            "stream": true,
            "cache_prompt": true,
            "n_predict": request.max_tokens,
            "temperature": request.sampling.temperature(),
            "stop": request.stop,
        });
        if let Some(top_k) = request.sampling.top_k() {
            body["top_k"] = json!(top_k);
        }

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::ServiceUnavailable(format!("Llama server unreachable: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ApiError::internal(format!(
                "Llama server error: {} {}",
                status,
                detail.trim()
            )));
        }

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Completion stream cancelled");
                        return;
                    }
                    next = stream.next() => next,
                };
                let Some(chunk) = next else {
                    return;
                };
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ApiError::internal(e))).await;
                        return;
                    }
                };
                for event in decoder.push(&bytes) {
                    if let Some(content) = event.content.filter(|c| !c.is_empty()) {
                        if tx.send(Ok(content)).await.is_err() {
                            return;
                        }
                    }
                    if event.stop {
                        let _ = tx.send(Ok(end_marker.to_string())).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let url = format!("{}/embedding", self.base_url().await?);

        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            let res = self
                .client
                .post(&url)
                .json(&json!({ "content": input }))
                .send()
                .await
                .map_err(|e| ApiError::ServiceUnavailable(format!("Embedding server unreachable: {}", e)))?;

            if !res.status().is_success() {
                return Err(ApiError::internal(format!(
                    "Llama server error: {}",
                    res.status()
                )));
            }

            let data: Value = res.json().await.map_err(ApiError::internal)?;
            let embedding = parse_embedding(&data)
                .ok_or_else(|| ApiError::internal("Invalid embedding response"))?;
            results.push(embedding);
        }

        Ok(results)
    }
}

#[derive(Debug, Default, PartialEq)]
struct SseEvent {
    content: Option<String>,
    stop: bool,
}

/// Splits a byte stream into `data:` events, holding back partial lines.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(payload) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if payload == "[DONE]" {
                events.push(SseEvent {
                    content: None,
                    stop: true,
                });
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(payload) {
                events.push(SseEvent {
                    content: value["content"].as_str().map(str::to_string),
                    stop: value["stop"].as_bool().unwrap_or(false),
                });
            }
        }
        events
    }
}

/// Accepts both the flat `{"embedding": [..]}` shape and the newer
/// `[{"index": 0, "embedding": [[..]]}]` shape.
fn parse_embedding(data: &Value) -> Option<Vec<f32>> {
    let embedding = match data {
        Value::Array(items) => items.first()?.get("embedding")?,
        Value::Object(_) => data.get("embedding")?,
        _ => return None,
    };
    let values = match embedding.as_array()?.first() {
        Some(Value::Array(_)) => embedding.as_array()?.first()?.as_array()?,
        _ => embedding.as_array()?,
    };
    values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_holds_partial_lines_until_complete() {
        let mut decoder = SseDecoder::default();

        let first = decoder.push(b"data: {\"content\":\"Hel");
        assert!(first.is_empty());

        let second = decoder.push(b"lo\",\"stop\":false}\n\ndata: {\"content\":\"\",\"stop\":true}\n");
        assert_eq!(
            second,
            vec![
                SseEvent {
                    content: Some("Hello".to_string()),
                    stop: false
                },
                SseEvent {
                    content: Some(String::new()),
                    stop: true
                },
            ]
        );
    }

    #[test]
    fn decoder_keeps_multibyte_characters_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"content\":\"caf\u{e9}\"}\n".as_bytes();
        let (head, tail) = line.split_at(line.len() - 4);

        assert!(decoder.push(head).is_empty());
        let events = decoder.push(tail);
        assert_eq!(events[0].content.as_deref(), Some("caf\u{e9}"));
    }

    #[test]
    fn embedding_shapes() {
        assert_eq!(
            parse_embedding(&json!({ "embedding": [0.5, 1.0] })),
            Some(vec![0.5, 1.0])
        );
        assert_eq!(
            parse_embedding(&json!([{ "index": 0, "embedding": [[0.25, 0.75]] }])),
            Some(vec![0.25, 0.75])
        );
        assert_eq!(parse_embedding(&json!({ "error": "nope" })), None);
    }
}
