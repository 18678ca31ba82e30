mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use blinkchat_backend::chat::{BufferSink, ChannelSink, ChatOrchestrator, TurnOutcome, TurnRequest};
use blinkchat_backend::core::config::settings::{
    ChatSettings, ConversationProfile, DEFAULT_FALLBACK_MESSAGE, DEFAULT_RESET_MESSAGE,
};
use blinkchat_backend::core::errors::ApiError;
use blinkchat_backend::history::{HistoryStore, Message, Role, Transcript};

use common::{partition, FailingCache, FixedRetriever, Harness, Script, ScriptedEngine, END};

async fn run(orchestrator: &ChatOrchestrator, request: TurnRequest) -> (Result<TurnOutcome, ApiError>, BufferSink) {
    let mut sink = BufferSink::new();
    let outcome = orchestrator
        .handle(request, &mut sink, CancellationToken::new())
        .await;
    (outcome, sink)
}

async fn seed(history: &HistoryStore, session: &str, messages: Vec<Message>) {
    history
        .save(session, &Transcript::from_messages(messages))
        .await
        .unwrap();
}

#[tokio::test]
async fn end_of_turn_marker_is_not_forwarded_and_saves_once() {
    let harness = Harness::new(vec![Script::reply(&["Hello", " world", END])]);
    let orchestrator = harness.assistant();

    let (outcome, sink) = run(&orchestrator, TurnRequest::new("s1", "hi")).await;

    assert_eq!(
        outcome.unwrap(),
        TurnOutcome::Completed {
            reply: "Hello world".to_string()
        }
    );
    assert_eq!(sink.chunks, vec!["Hello", " world"]);
    assert_eq!(harness.cache.saves(), 1);
}

#[tokio::test]
async fn first_turn_then_regenerate_replaces_the_reply() {
    let harness = Harness::new(vec![
        Script::reply(&["Hello", " world", END]),
        Script::reply(&["Hi", " again", END]),
    ]);
    let orchestrator = harness.assistant();

    run(&orchestrator, TurnRequest::new("s1", "hi")).await.0.unwrap();
    let saved = harness.history.load("s1").await.unwrap();
    assert_eq!(
        saved.messages(),
        &[Message::user("hi"), Message::assistant("Hello world")]
    );

    let (outcome, sink) = run(&orchestrator, TurnRequest::regenerate("s1")).await;
    outcome.unwrap();
    assert_eq!(sink.text(), "Hi again");

    let regenerated = harness.history.load("s1").await.unwrap();
    assert_eq!(regenerated.len(), 2);
    assert_eq!(regenerated.messages()[0], Message::user("hi"));
    assert_eq!(regenerated.messages()[1], Message::assistant("Hi again"));
    assert_eq!(harness.engine.regenerates(), 1);
}

#[tokio::test]
async fn reset_wins_over_regenerate() {
    let harness = Harness::new(Vec::new());
    seed(
        &harness.history,
        "s1",
        vec![Message::user("hi"), Message::assistant("hello")],
    )
    .await;
    let orchestrator = harness.assistant();

    let request = TurnRequest {
        regenerate: true,
        ..TurnRequest::reset("s1")
    };
    let (outcome, sink) = run(&orchestrator, request).await;

    assert_eq!(outcome.unwrap(), TurnOutcome::Reset);
    assert_eq!(sink.text(), DEFAULT_RESET_MESSAGE);
    assert_eq!(harness.engine.regenerates(), 0);
    assert_eq!(harness.engine.submits(), 0);
    assert!(harness.history.load("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_retrieval_sends_fallback_without_generating() {
    let harness = Harness::new(Vec::new());
    let orchestrator = harness.agent(FixedRetriever::empty());

    let (outcome, sink) = run(&orchestrator, TurnRequest::new("s1", "what is rust?")).await;

    assert_eq!(outcome.unwrap(), TurnOutcome::Fallback);
    assert_eq!(sink.text(), DEFAULT_FALLBACK_MESSAGE);
    assert_eq!(harness.engine.submits(), 0);
    assert_eq!(harness.cache.saves(), 0);
}

#[tokio::test]
async fn fallback_turns_are_saved_when_configured() {
    let harness = Harness::new(Vec::new());
    let settings = ChatSettings {
        persist_fallback_turns: true,
        ..ChatSettings::default()
    };
    let orchestrator = harness.agent_with(FixedRetriever::empty(), settings);

    run(&orchestrator, TurnRequest::new("s1", "what is rust?")).await.0.unwrap();

    let saved = harness.history.load("s1").await.unwrap();
    assert_eq!(
        saved.messages(),
        &[
            Message::user("what is rust?"),
            Message::assistant(DEFAULT_FALLBACK_MESSAGE)
        ]
    );
}

#[tokio::test]
async fn grounded_turn_prompts_with_context_and_records_raw_query() {
    let harness = Harness::new(vec![Script::reply(&["LINQ queries collections.", END])]);
    let retriever = FixedRetriever::new(vec![partition("linq", "LINQ is a query syntax.")]);
    let orchestrator = harness.agent(retriever.clone());

    let (outcome, _) = run(&orchestrator, TurnRequest::new("s1", "What is LINQ?")).await;
    outcome.unwrap();

    let prompts = harness.engine.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with("Context:\n[1] (Section: linq)"));
    assert!(prompts[0].ends_with("Question: What is LINQ?"));

    let saved = harness.history.load("s1").await.unwrap();
    assert_eq!(saved.messages()[0], Message::user("What is LINQ?"));
    assert_eq!(*retriever.lookups.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn gpu_engines_retrieve_more_partitions() {
    let harness = Harness {
        engine: ScriptedEngine::with_gpu(vec![Script::reply(&["ok", END])]),
        ..Harness::new(Vec::new())
    };
    let retriever = FixedRetriever::new(vec![partition("a", "x"), partition("b", "y")]);
    let orchestrator = harness.agent(retriever.clone());

    run(&orchestrator, TurnRequest::new("s1", "q")).await.0.unwrap();

    assert_eq!(*retriever.lookups.lock().unwrap(), vec![3]);
}

#[tokio::test]
async fn regenerate_skips_retrieval() {
    let harness = Harness::new(vec![Script::reply(&["again", END])]);
    seed(
        &harness.history,
        "s1",
        vec![Message::user("q"), Message::assistant("first")],
    )
    .await;
    let retriever = FixedRetriever::empty();
    let orchestrator = harness.agent(retriever.clone());

    let (outcome, sink) = run(&orchestrator, TurnRequest::regenerate("s1")).await;

    outcome.unwrap();
    assert_eq!(sink.text(), "again");
    assert!(retriever.lookups.lock().unwrap().is_empty());
}

#[tokio::test]
async fn regenerate_without_a_prior_question_is_rejected() {
    let harness = Harness::new(Vec::new());
    let orchestrator = harness.assistant();

    let (outcome, sink) = run(&orchestrator, TurnRequest::regenerate("fresh")).await;

    assert!(matches!(outcome, Err(ApiError::BadRequest(_))));
    assert!(matches!(sink.failure, Some(ApiError::BadRequest(_))));
    assert!(sink.chunks.is_empty());
    assert_eq!(harness.engine.regenerates(), 0);
}

#[tokio::test]
async fn blank_session_is_rejected_before_any_work() {
    let harness = Harness::new(Vec::new());
    let orchestrator = harness.assistant();

    let (outcome, sink) = run(&orchestrator, TurnRequest::new(" ", "hi")).await;

    assert!(matches!(outcome, Err(ApiError::BadRequest(_))));
    assert!(sink.failure.is_some());
    assert_eq!(harness.engine.submits(), 0);
}

#[tokio::test]
async fn store_failure_is_reported_before_streaming() {
    let engine = ScriptedEngine::new(Vec::new());
    let orchestrator = ChatOrchestrator::new(
        HistoryStore::new(Arc::new(FailingCache)),
        engine.clone(),
        ConversationProfile::assistant(),
        ChatSettings::default(),
    );

    let (outcome, sink) = run(&orchestrator, TurnRequest::new("s1", "hi")).await;

    assert!(matches!(outcome, Err(ApiError::StoreUnavailable(_))));
    assert!(matches!(sink.failure, Some(ApiError::StoreUnavailable(_))));
    assert_eq!(engine.submits(), 0);
}

#[tokio::test]
async fn timeout_keeps_partial_output_and_cancels_generation() {
    let harness = Harness::new(vec![Script::stalled(&["partial"])]);
    let settings = ChatSettings {
        generation_timeout_secs: 1,
        ..ChatSettings::default()
    };
    let orchestrator = harness.assistant_with(settings);

    let (outcome, sink) = run(&orchestrator, TurnRequest::new("s1", "hi")).await;

    assert!(matches!(outcome, Err(ApiError::GenerationTimeout(_))));
    assert_eq!(sink.chunks, vec!["partial"]);
    assert!(sink.failure.is_none());
    assert_eq!(harness.cache.saves(), 0);

    for _ in 0..50 {
        if harness.engine.cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(harness.engine.cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stream_without_marker_is_not_saved() {
    let harness = Harness::new(vec![Script::reply(&["cut", " short"])]);
    let orchestrator = harness.assistant();

    let (outcome, sink) = run(&orchestrator, TurnRequest::new("s1", "hi")).await;

    assert_eq!(
        outcome.unwrap(),
        TurnOutcome::Incomplete {
            partial: "cut short".to_string()
        }
    );
    assert_eq!(sink.text(), "cut short");
    assert_eq!(harness.cache.saves(), 0);
}

#[tokio::test]
async fn mid_stream_errors_are_not_reported_to_the_sink() {
    let script = Script {
        chunks: vec![Ok("so far".to_string()), Err(ApiError::BackendRejected("boom".into()))],
        stall: false,
    };
    let harness = Harness::new(vec![script]);
    let orchestrator = harness.assistant();

    let (outcome, sink) = run(&orchestrator, TurnRequest::new("s1", "hi")).await;

    assert!(matches!(outcome, Err(ApiError::BackendRejected(_))));
    assert_eq!(sink.text(), "so far");
    assert!(sink.failure.is_none());
    assert_eq!(harness.cache.saves(), 0);
}

#[tokio::test]
async fn stored_system_messages_do_not_survive_a_turn() {
    let harness = Harness::new(vec![Script::reply(&["fine", END])]);
    seed(
        &harness.history,
        "s1",
        vec![Message::new(Role::System, "old prompt"), Message::user("a"), Message::assistant("b")],
    )
    .await;
    let orchestrator = harness.assistant();

    run(&orchestrator, TurnRequest::new("s1", "c")).await.0.unwrap();

    let saved = harness.history.load("s1").await.unwrap();
    assert_eq!(saved.len(), 4);
    assert!(saved.messages().iter().all(|m| m.role != Role::System));
}

#[tokio::test]
async fn concurrent_turns_on_one_session_do_not_lose_updates() {
    let harness = Harness::new(vec![
        Script::reply(&["one", END]),
        Script::reply(&["two", END]),
    ]);
    let orchestrator = Arc::new(harness.assistant());

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { run(&orchestrator, TurnRequest::new("s1", "q1")).await.0 })
    };
    let second = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { run(&orchestrator, TurnRequest::new("s1", "q2")).await.0 })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let saved = harness.history.load("s1").await.unwrap();
    assert_eq!(saved.len(), 4);
}

#[tokio::test]
async fn reset_completes_after_the_client_left() {
    let harness = Harness::new(Vec::new());
    seed(&harness.history, "s1", vec![Message::user("hi"), Message::assistant("hello")]).await;
    let orchestrator = harness.assistant();
    let (mut sink, rx) = ChannelSink::channel();
    drop(rx);

    let outcome = orchestrator
        .handle(TurnRequest::reset("s1"), &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.unwrap(), TurnOutcome::Reset);
    assert!(harness.history.load("s1").await.unwrap().is_empty());
    assert_eq!(harness.engine.prepares(), 0);
}

#[tokio::test]
async fn fallback_completes_after_the_client_left() {
    let harness = Harness::new(Vec::new());
    let orchestrator = harness.agent(FixedRetriever::empty());
    let (mut sink, rx) = ChannelSink::channel();
    drop(rx);

    let outcome = orchestrator
        .handle(TurnRequest::new("s1", "what is rust?"), &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.unwrap(), TurnOutcome::Fallback);
    assert_eq!(harness.engine.submits(), 0);
}

#[tokio::test]
async fn model_load_does_not_count_against_the_generation_timeout() {
    let engine = ScriptedEngine::slow_to_prepare(
        vec![Script::reply(&["late", END]), Script::reply(&["again", END])],
        Duration::from_millis(1500),
    );
    let harness = Harness::with_engine(engine);
    let settings = ChatSettings {
        generation_timeout_secs: 1,
        ..ChatSettings::default()
    };
    let orchestrator = harness.assistant_with(settings);

    let (outcome, sink) = run(&orchestrator, TurnRequest::new("s1", "hi")).await;
    assert_eq!(
        outcome.unwrap(),
        TurnOutcome::Completed {
            reply: "late".to_string()
        }
    );
    assert_eq!(sink.text(), "late");

    let (outcome, _) = run(&orchestrator, TurnRequest::regenerate("s1")).await;
    assert!(matches!(outcome.unwrap(), TurnOutcome::Completed { .. }));
    assert_eq!(harness.engine.prepares(), 2);
    assert_eq!(harness.cache.saves(), 2);
}
