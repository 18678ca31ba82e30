use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::chat::{streaming_response, AgentRequest, ChatPrompt, TurnRequest};
use crate::core::errors::ApiError;
use crate::state::AppState;

const INVALID_PARAMETERS: &str = "Invalid parameters.";

pub async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatPrompt>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(prompt)) => streaming_response(state.chat.clone(), TurnRequest::from(prompt)).await,
        Err(rejection) => invalid_parameters(rejection),
    }
}

pub async fn agent(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(request)) => {
            streaming_response(state.agent.clone(), TurnRequest::from(request)).await
        }
        Err(rejection) => invalid_parameters(rejection),
    }
}

fn invalid_parameters(rejection: JsonRejection) -> Response {
    tracing::debug!("Rejected chat body: {}", rejection.body_text());
    ApiError::BadRequest(INVALID_PARAMETERS.to_string()).into_response()
}
