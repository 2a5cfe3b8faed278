//! Aggregate health endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::runner::ModelHealth;
use crate::state::AppState;

/// Timeout of each per-model upstream probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    active_runners: BTreeMap<String, bool>,
    runner_current_models: BTreeMap<String, Option<String>>,
    runner_info: BTreeMap<String, RunnerInfo>,
    model_health: BTreeMap<String, ModelHealth>,
}

#[derive(Debug, Serialize)]
struct RunnerInfo {
    host: String,
    port: u16,
    current_model: Option<String>,
    is_active: bool,
}

/// GET /health - live snapshot of every runner and every model placement.
/// Nothing is cached; each call probes the upstreams afresh.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let manager = &state.manager;

    let mut active_runners = BTreeMap::new();
    for name in manager.runner_names() {
        active_runners.insert(name.clone(), manager.is_runner_running(&name).await);
    }

    let mut model_health = BTreeMap::new();
    for alias in manager.model_aliases() {
        model_health.insert(
            alias.clone(),
            manager.probe_model_health(alias, PROBE_TIMEOUT).await,
        );
    }

    let mut runner_current_models = BTreeMap::new();
    let mut runner_info = BTreeMap::new();
    for name in manager.runner_names() {
        let current_model = manager.current_model_for_runner(&name).await;
        runner_current_models.insert(name.clone(), current_model.clone());
        if let Some(runner) = manager.runner(&name) {
            runner_info.insert(
                name.clone(),
                RunnerInfo {
                    host: runner.host().to_string(),
                    port: runner.port(),
                    current_model,
                    is_active: active_runners.get(&name).copied().unwrap_or(false),
                },
            );
        }
    }

    Json(HealthResponse {
        status: "ok",
        active_runners,
        runner_current_models,
        runner_info,
        model_health,
    })
}
