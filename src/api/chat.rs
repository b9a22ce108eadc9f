//! Chat ingress handlers.
//!
//! Both ingress shapes dispatch into the pipeline orchestrator. The pipeline
//! runs in a spawned task so a panic anywhere inside a subsystem is caught
//! here and surfaced as a 500 without poisoning shared state for other
//! requests.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tracing::error;

use crate::envelope::IngressShape;
use crate::error::AppError;
use crate::pipeline;
use crate::AppState;

/// POST /v1/messages
pub async fn anthropic_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, IngressShape::AnthropicMessages, headers, body).await
}

/// POST /v1/chat/completions
pub async fn openai_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, IngressShape::OpenAiChat, headers, body).await
}

async fn dispatch(
    state: AppState,
    ingress: IngressShape,
    headers: HeaderMap,
    body: Value,
) -> Response {
    let task = tokio::spawn(pipeline::handle_chat(state, ingress, headers, body));
    match task.await {
        Ok(response) => response,
        Err(join_error) => {
            // A panicked pipeline task must not take the process or any
            // other request down with it.
            if join_error.is_panic() {
                error!("Pipeline panicked; returning 500");
            } else {
                error!(error = %join_error, "Pipeline task failed");
            }
            AppError::Internal("request processing failed".to_string()).into_response()
        }
    }
}
