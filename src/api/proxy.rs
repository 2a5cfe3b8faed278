//! Inference request forwarding.
//!
//! Every inference endpoint goes through the same pre-flight: resolve the
//! model alias from the request body, make the owning runner ready (starting
//! or switching it if needed), then forward. Non-streaming replies are
//! decoded and re-encoded as JSON; streaming replies are piped back to the
//! client byte-for-byte.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::state::AppState;

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response> {
    forward(state, "/v1/chat/completions", body).await
}

/// POST /v1/completions
pub async fn completions(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    forward(state, "/v1/completions", body).await
}

/// POST /v1/embeddings
pub async fn embeddings(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    forward(state, "/v1/embeddings", body).await
}

/// POST /v1/rerank
pub async fn rerank(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    forward(state, "/v1/rerank", body).await
}

async fn forward(state: Arc<AppState>, endpoint: &str, body: Bytes) -> Result<Response> {
    let data: Value = serde_json::from_slice(&body).map_err(|_| Error::InvalidJson)?;

    let alias = resolve_model_alias(&state, &data).ok_or(Error::ModelNotSpecified)?;
    if state.config.model_by_alias(&alias).is_none() {
        return Err(Error::ModelNotFound(alias));
    }

    tracing::debug!("Ensuring model {alias} is ready for request to {endpoint}");
    if let Err(message) = state.manager.ensure_model_ready_with_retry(&alias).await {
        tracing::error!("Model {alias} not ready: {message}");
        return Err(Error::ModelNotReady(message));
    }

    let streaming = data.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if streaming {
        tracing::debug!("Forwarding streaming request to model {alias} at {endpoint}");
        forward_streaming(&state, &alias, endpoint, &data).await
    } else {
        tracing::debug!("Forwarding request to model {alias} at {endpoint}");
        let (status, payload) = state.manager.forward_request(&alias, endpoint, &data).await;
        Ok((status, Json(payload)).into_response())
    }
}

/// The `model` field of the request, or the first configured alias.
fn resolve_model_alias(state: &AppState, data: &Value) -> Option<String> {
    if let Some(model) = data.get("model").and_then(Value::as_str) {
        return Some(model.to_string());
    }
    state.manager.model_aliases().first().cloned()
}

/// Pipe an upstream streaming response straight through to the client.
async fn forward_streaming(
    state: &AppState,
    alias: &str,
    endpoint: &str,
    data: &Value,
) -> Result<Response> {
    let runner = state
        .manager
        .runner_for_model(alias)
        .ok_or_else(|| Error::ModelNotAvailable(alias.to_string()))?;

    // The model can be switched away between pre-flight and now; re-run the
    // readiness protocol once instead of streaming from the wrong model.
    if !runner.is_model_loaded(alias).await {
        tracing::warn!(
            "Model {alias} not loaded during streaming request, attempting to ensure readiness"
        );
        if let Err(message) = state.manager.ensure_model_ready_with_retry(alias).await {
            return Err(Error::ModelNotReady(message));
        }
    }

    let url = format!("http://{}:{}{}", runner.host(), runner.port(), endpoint);
    // No total timeout here: the body arrives incrementally for as long as
    // the model generates.
    let upstream = state
        .manager
        .http_client()
        .post(&url)
        .json(data)
        .send()
        .await
        .map_err(|e| {
            tracing::error!("Error forwarding streaming request to {url}: {e}");
            Error::StreamingForward(e.to_string())
        })?;

    let status = upstream.status();
    if status != reqwest::StatusCode::OK {
        let text = upstream.text().await.unwrap_or_default();
        let payload = serde_json::from_str::<Value>(&text)
            .unwrap_or_else(|_| json!({"error": {"message": text}}));
        let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Ok((status, Json(payload)).into_response());
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/event-stream")
        .to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::Internal(e.to_string()))
}
