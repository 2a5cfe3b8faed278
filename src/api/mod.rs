//! OpenAI-compatible HTTP API.

pub mod health;
pub mod models;
pub mod proxy;
pub mod runners;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Request body cap; image-bearing chat requests can be large.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let health_endpoint = state.config.api.health_endpoint.clone();

    let mut app = Router::new()
        .route("/v1/models", get(models::list_models))
        .route("/v1/chat/completions", post(proxy::chat_completions))
        .route("/v1/completions", post(proxy::completions))
        .route("/v1/embeddings", post(proxy::embeddings))
        .route("/v1/rerank", post(proxy::rerank))
        .route("/v1/runners/status", get(runners::runners_status))
        .route("/v1/runners/:runner_name/start", post(runners::start_runner))
        .route("/v1/runners/:runner_name/stop", post(runners::stop_runner))
        .route(
            "/v1/runners/:runner_name/restart",
            post(runners::restart_runner),
        )
        .route("/health", get(health::health));

    if health_endpoint != "/health" {
        app = app.route(&health_endpoint, get(health::health));
    }

    app.layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
