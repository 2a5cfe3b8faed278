//! Models endpoint (OpenAI-compatible).

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// OpenAI-compatible model list response.
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelData>,
}

#[derive(Debug, Serialize)]
struct ModelData {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

/// GET /v1/models - list configured model aliases in declaration order.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let created = Utc::now().timestamp();
    let data = state
        .manager
        .model_aliases()
        .iter()
        .map(|alias| ModelData {
            id: alias.clone(),
            object: "model",
            created,
            owned_by: "user",
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}
