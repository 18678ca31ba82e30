use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use super::orchestrator::ChatOrchestrator;
use super::request::TurnRequest;
use super::sink::{ChannelSink, SinkEvent};

/// Runs the turn on its own task and answers with whatever it produces
/// first: a streaming 200 for a chunk, the error's status for a failure.
/// Dropping the response body cancels generation.
pub async fn streaming_response(orchestrator: Arc<ChatOrchestrator>, request: TurnRequest) -> Response {
    let (mut sink, mut rx) = ChannelSink::channel();
    let cancel = CancellationToken::new();
    let turn_cancel = cancel.clone();

    tokio::spawn(async move {
        let _ = orchestrator.handle(request, &mut sink, turn_cancel).await;
    });

    let guard = cancel.drop_guard();
    match rx.recv().await {
        Some(SinkEvent::Chunk(first)) => {
            let body = stream::unfold((Some(first), rx, guard), |(pending, mut rx, guard)| async move {
                let chunk = match pending {
                    Some(chunk) => chunk,
                    None => match rx.recv().await {
                        Some(SinkEvent::Chunk(chunk)) => chunk,
                        _ => return None,
                    },
                };
                Some((Ok::<_, Infallible>(Bytes::from(chunk)), (None, rx, guard)))
            });
            event_stream(Body::from_stream(body))
        }
        Some(SinkEvent::Failed(err)) => err.into_response(),
        None => event_stream(Body::empty()),
    }
}

fn event_stream(body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
