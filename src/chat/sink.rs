use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::errors::ApiError;

/// The consumer went away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Where a turn's output goes. Each write completes only once the
/// consumer has taken the previous chunk.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, chunk: &str) -> Result<(), SinkClosed>;

    /// Reports a failure that happened before anything was written.
    async fn fail(&mut self, error: ApiError);

    fn started(&self) -> bool;
}

#[derive(Debug)]
pub enum SinkEvent {
    Chunk(String),
    Failed(ApiError),
}

/// Sink backed by a channel of capacity one, so the producer advances
/// at the consumer's pace.
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
    started: bool,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx, started: false }, rx)
    }
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn write(&mut self, chunk: &str) -> Result<(), SinkClosed> {
        self.tx
            .send(SinkEvent::Chunk(chunk.to_string()))
            .await
            .map_err(|_| SinkClosed)?;
        self.started = true;
        Ok(())
    }

    async fn fail(&mut self, error: ApiError) {
        let _ = self.tx.send(SinkEvent::Failed(error)).await;
    }

    fn started(&self) -> bool {
        self.started
    }
}

/// Collects everything in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub chunks: Vec<String>,
    pub failure: Option<ApiError>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.chunks.concat()
    }
}

#[async_trait]
impl ChunkSink for BufferSink {
    async fn write(&mut self, chunk: &str) -> Result<(), SinkClosed> {
        self.chunks.push(chunk.to_string());
        Ok(())
    }

    async fn fail(&mut self, error: ApiError) {
        self.failure = Some(error);
    }

    fn started(&self) -> bool {
        !self.chunks.is_empty()
    }
}
