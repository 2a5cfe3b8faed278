//! Runner control plane: imperative start/stop/restart plus status.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::state::AppState;

/// Pause between stop and start during a restart, so ports and GPU memory
/// are released before the new process comes up.
const RESTART_PAUSE: Duration = Duration::from_secs(1);

fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn unknown_runner(runner_name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": {"message": format!("Unknown runner: {runner_name}")}
        })),
    )
        .into_response()
}

fn action_ok(runner_name: &str, action: &str, past_tense: &str, status: &str) -> Response {
    Json(json!({
        "success": true,
        "message": format!("Runner {runner_name} {past_tense} successfully"),
        "runner_name": runner_name,
        "action": action,
        "status": status,
        "timestamp": utc_timestamp(),
    }))
    .into_response()
}

fn action_failed(runner_name: &str, action: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": {
                "message": format!("Failed to {action} runner: {runner_name}"),
                "type": "runner_error",
                "runner_name": runner_name,
            }
        })),
    )
        .into_response()
}

/// GET /v1/runners/status
pub async fn runners_status(State(state): State<Arc<AppState>>) -> Response {
    let runners = state.manager.get_runner_status().await;
    Json(json!({
        "success": true,
        "runners": runners,
        "timestamp": utc_timestamp(),
    }))
    .into_response()
}

/// POST /v1/runners/{runner_name}/start
pub async fn start_runner(
    State(state): State<Arc<AppState>>,
    Path(runner_name): Path<String>,
) -> Response {
    if state.manager.runner(&runner_name).is_none() {
        return unknown_runner(&runner_name);
    }

    if state.manager.start_runner(&runner_name).await {
        action_ok(&runner_name, "start", "started", "starting")
    } else {
        action_failed(&runner_name, "start")
    }
}

/// POST /v1/runners/{runner_name}/stop
pub async fn stop_runner(
    State(state): State<Arc<AppState>>,
    Path(runner_name): Path<String>,
) -> Response {
    if state.manager.runner(&runner_name).is_none() {
        return unknown_runner(&runner_name);
    }

    if state.manager.stop_runner(&runner_name).await {
        action_ok(&runner_name, "stop", "stopped", "stopping")
    } else {
        action_failed(&runner_name, "stop")
    }
}

/// POST /v1/runners/{runner_name}/restart - stop, pause, start again with
/// the runner's first declared model.
pub async fn restart_runner(
    State(state): State<Arc<AppState>>,
    Path(runner_name): Path<String>,
) -> Response {
    if state.manager.runner(&runner_name).is_none() {
        return unknown_runner(&runner_name);
    }

    tracing::info!("Restarting runner {runner_name}");
    if !state.manager.stop_runner(&runner_name).await {
        tracing::warn!("Failed to stop runner {runner_name} during restart, continuing anyway");
    }

    tokio::time::sleep(RESTART_PAUSE).await;

    if state.manager.start_runner(&runner_name).await {
        action_ok(&runner_name, "restart", "restarted", "restarting")
    } else {
        action_failed(&runner_name, "restart")
    }
}
