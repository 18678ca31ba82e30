//! Runs one conversational turn: load history, pick the mode, stream the
//! reply into a sink, then persist.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::request::{TurnMode, TurnRequest};
use super::sink::ChunkSink;
use crate::core::config::settings::{ChatSettings, ConversationProfile};
use crate::core::errors::ApiError;
use crate::history::{HistoryStore, SessionLocks};
use crate::llm::{is_end_of_turn, Conversation, GenerationEngine, TokenStream};
use crate::rag::{RetrievalPolicy, Retriever};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// History was cleared and the acknowledgement sent.
    Reset,
    /// Retrieval found nothing; the fallback message was sent instead.
    Fallback,
    /// The reply streamed to completion and was saved.
    Completed { reply: String },
    /// The engine closed its stream without an end-of-turn marker.
    Incomplete { partial: String },
    /// The client went away or the turn was cancelled.
    Cancelled,
}

enum Streamed {
    Complete(String),
    Unfinished(TurnOutcome),
}

pub struct ChatOrchestrator {
    history: HistoryStore,
    engine: Arc<dyn GenerationEngine>,
    retriever: Option<Arc<dyn Retriever>>,
    profile: ConversationProfile,
    policy: RetrievalPolicy,
    settings: ChatSettings,
    locks: SessionLocks,
}

impl ChatOrchestrator {
    pub fn new(
        history: HistoryStore,
        engine: Arc<dyn GenerationEngine>,
        profile: ConversationProfile,
        settings: ChatSettings,
    ) -> Self {
        Self {
            history,
            engine,
            retriever: None,
            profile,
            policy: RetrievalPolicy::default(),
            settings,
            locks: SessionLocks::new(),
        }
    }

    /// Grounds plain questions in retrieved partitions.
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>, policy: RetrievalPolicy) -> Self {
        self.retriever = Some(retriever);
        self.policy = policy;
        self
    }

    /// Shares the per-session lock table with other orchestrators writing
    /// the same history.
    pub fn with_locks(mut self, locks: SessionLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Runs a turn and reports any failure to the sink if nothing was
    /// written yet. Once streaming has begun failures are only logged.
    pub async fn handle(
        &self,
        request: TurnRequest,
        sink: &mut dyn ChunkSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, ApiError> {
        let session_id = request.session_id.clone();
        match self.run(request, sink, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if sink.started() {
                    tracing::error!(session_id, error = %err, "Turn failed after streaming began");
                } else {
                    tracing::error!(session_id, error = %err, "Turn failed");
                    sink.fail(err.clone()).await;
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        request: TurnRequest,
        sink: &mut dyn ChunkSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, ApiError> {
        let mode = request.mode()?;
        let session_id = request.session_id.as_str();

        let _guard = self.locks.acquire(session_id).await;
        let transcript = self.history.load(session_id).await?;
        let mut conversation = self.engine.new_conversation(&transcript, &self.profile);
        tracing::debug!(session_id, messages = transcript.len(), "Loaded session history");

        match mode {
            TurnMode::Reset => {
                self.history.clear(session_id).await?;
                conversation.clear_history();
                if sink.write(&self.settings.reset_message).await.is_err() {
                    tracing::debug!(session_id, "Client disconnected before the reset message was sent");
                }
                tracing::info!(session_id, "Chat history reset");
                Ok(TurnOutcome::Reset)
            }
            TurnMode::Regenerate => {
                conversation.prompt_for_regenerate()?;
                self.engine.prepare().await?;
                let deadline = self.deadline();
                let stream = self
                    .within(deadline, self.engine.regenerate(&conversation, cancel.clone()))
                    .await?;
                match self.forward(session_id, stream, sink, &cancel, deadline).await? {
                    Streamed::Complete(reply) => {
                        conversation.record_regenerated(&reply)?;
                        self.history.save(session_id, &conversation.transcript()).await?;
                        Ok(TurnOutcome::Completed { reply })
                    }
                    Streamed::Unfinished(outcome) => Ok(outcome),
                }
            }
            TurnMode::Ask { query } => {
                self.engine.prepare().await?;
                let grounding = match &self.retriever {
                    Some(retriever) => {
                        let top_k = self.policy.top_k(self.engine.has_gpu_support());
                        let partitions = retriever
                            .find_matching_partitions(&query, top_k, self.policy.force_unique_section)
                            .await?;
                        if partitions.is_empty() {
                            return self.fallback(session_id, &query, conversation, sink).await;
                        }
                        tracing::debug!(session_id, partitions = partitions.len(), "Grounding turn");
                        Some((retriever, partitions))
                    }
                    None => None,
                };

                let deadline = self.deadline();
                let stream = match grounding {
                    Some((retriever, partitions)) => {
                        self.within(
                            deadline,
                            retriever.query_partitions(
                                &query,
                                &partitions,
                                &conversation,
                                self.engine.as_ref(),
                                cancel.clone(),
                            ),
                        )
                        .await?
                    }
                    None => {
                        self.within(deadline, self.engine.submit(&conversation, &query, cancel.clone()))
                            .await?
                    }
                };

                match self.forward(session_id, stream, sink, &cancel, deadline).await? {
                    Streamed::Complete(reply) => {
                        conversation.record_reply(&query, &reply);
                        self.history.save(session_id, &conversation.transcript()).await?;
                        Ok(TurnOutcome::Completed { reply })
                    }
                    Streamed::Unfinished(outcome) => Ok(outcome),
                }
            }
        }
    }

    async fn fallback(
        &self,
        session_id: &str,
        query: &str,
        mut conversation: Conversation,
        sink: &mut dyn ChunkSink,
    ) -> Result<TurnOutcome, ApiError> {
        tracing::info!(session_id, "No matching partitions, sending fallback message");
        let message = &self.settings.fallback_message;
        if sink.write(message).await.is_err() {
            tracing::debug!(session_id, "Client disconnected before the fallback message was sent");
        }
        if self.settings.persist_fallback_turns {
            conversation.record_reply(query, message);
            self.history.save(session_id, &conversation.transcript()).await?;
        }
        Ok(TurnOutcome::Fallback)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.settings.generation_timeout()
    }

    async fn within<F>(&self, deadline: Instant, fut: F) -> Result<TokenStream, ApiError>
    where
        F: std::future::Future<Output = Result<TokenStream, ApiError>>,
    {
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| ApiError::GenerationTimeout(self.settings.generation_timeout()))?
    }

    /// Forwards chunks until the end-of-turn marker. The marker itself is
    /// never written.
    async fn forward(
        &self,
        session_id: &str,
        mut stream: TokenStream,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Streamed, ApiError> {
        let mut reply = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(cancelled(session_id)),
                _ = tokio::time::sleep_until(deadline) => {
                    cancel.cancel();
                    return Err(ApiError::GenerationTimeout(self.settings.generation_timeout()));
                }
                next = stream.recv() => next,
            };

            match next {
                Some(Ok(chunk)) if is_end_of_turn(&chunk) => return Ok(Streamed::Complete(reply)),
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    match tokio::time::timeout_at(deadline, sink.write(&chunk)).await {
                        Ok(Ok(())) => reply.push_str(&chunk),
                        Ok(Err(_)) => {
                            cancel.cancel();
                            return Ok(cancelled(session_id));
                        }
                        Err(_) => {
                            cancel.cancel();
                            return Err(ApiError::GenerationTimeout(self.settings.generation_timeout()));
                        }
                    }
                }
                Some(Err(err)) => {
                    cancel.cancel();
                    return Err(err);
                }
                None => {
                    tracing::warn!(session_id, "Generation ended without an end-of-turn marker, history not saved");
                    return Ok(Streamed::Unfinished(TurnOutcome::Incomplete { partial: reply }));
                }
            }
        }
    }
}

fn cancelled(session_id: &str) -> Streamed {
    tracing::info!(session_id, "Turn cancelled, history not saved");
    Streamed::Unfinished(TurnOutcome::Cancelled)
}
