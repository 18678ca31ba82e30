mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use blinkchat_backend::chat::ChatOrchestrator;
use blinkchat_backend::core::config::settings::{
    AppConfig, ChatSettings, ConversationProfile, DEFAULT_FALLBACK_MESSAGE,
};
use blinkchat_backend::history::HistoryStore;
use blinkchat_backend::server;
use blinkchat_backend::state::AppState;

use common::{FailingCache, FixedRetriever, Harness, Script, ScriptedEngine, END};

async fn serve(state: Arc<AppState>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_app(harness: &Harness) -> String {
    let state = AppState::new(
        AppConfig::default(),
        Arc::new(harness.assistant()),
        Arc::new(harness.agent(FixedRetriever::empty())),
    );
    serve(state).await
}

#[tokio::test]
async fn health_reports_ok() {
    let base = spawn_app(&Harness::new(Vec::new())).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert!(body["uptime_secs"].is_u64());
}

#[tokio::test]
async fn chat_streams_reply_as_event_stream() {
    let harness = Harness::new(vec![Script::reply(&["Hello", " world", END])]);
    let base = spawn_app(&harness).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/ai/chat", base))
        .json(&json!({"query": "hi", "sessionId": "s1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(response.text().await.unwrap(), "Hello world");

    let saved = harness.history.load("s1").await.unwrap();
    assert_eq!(saved.len(), 2);
}

#[tokio::test]
async fn client_disconnect_cancels_generation() {
    let harness = Harness::new(vec![Script::stalled(&["partial"])]);
    let base = spawn_app(&harness).await;

    let mut response = reqwest::Client::new()
        .post(format!("{}/api/ai/chat", base))
        .json(&json!({"query": "hi", "sessionId": "s1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let first = response.chunk().await.unwrap().unwrap();
    assert_eq!(&first[..], b"partial");
    drop(response);

    for _ in 0..100 {
        if harness.engine.cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(harness.engine.cancelled.load(Ordering::SeqCst));
    assert_eq!(harness.cache.saves(), 0);
}

#[tokio::test]
async fn agent_without_matches_returns_fallback() {
    let harness = Harness::new(Vec::new());
    let base = spawn_app(&harness).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/agent", base))
        .json(&json!({"question": "anything?", "sessionId": "s1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), DEFAULT_FALLBACK_MESSAGE);
    assert_eq!(harness.engine.submits(), 0);
}

#[tokio::test]
async fn malformed_bodies_are_invalid_parameters() {
    let base = spawn_app(&Harness::new(Vec::new())).await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("{}/api/ai/chat", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body, json!({"error": "Invalid parameters."}));

    let unknown = client
        .post(format!("{}/api/agent", base))
        .json(&json!({"question": "q", "sessionId": "s1", "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 400);

    let no_session = client
        .post(format!("{}/api/ai/chat", base))
        .json(&json!({"query": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(no_session.status(), 400);
}

#[tokio::test]
async fn blank_session_id_is_rejected() {
    let base = spawn_app(&Harness::new(Vec::new())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/ai/chat", base))
        .json(&json!({"query": "hi", "sessionId": "  "}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "sessionId is required.");
}

#[tokio::test]
async fn store_outage_before_streaming_is_a_server_error() {
    let engine = ScriptedEngine::new(Vec::new());
    let orchestrator = Arc::new(ChatOrchestrator::new(
        HistoryStore::new(Arc::new(FailingCache)),
        engine.clone(),
        ConversationProfile::assistant(),
        ChatSettings::default(),
    ));
    let base = serve(AppState::new(AppConfig::default(), orchestrator.clone(), orchestrator)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/ai/chat", base))
        .json(&json!({"query": "hi", "sessionId": "s1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "connection refused");
    assert_eq!(engine.submits(), 0);
}
