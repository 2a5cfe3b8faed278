//! Integration tests for the gateway HTTP API.
//!
//! Runners are configured with a non-startable executable, so these tests
//! exercise the dispatch, validation and error surfaces without real
//! llama-server processes.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use flexllama::api;
use flexllama::config::Config;
use flexllama::runner::RunnerManager;
use flexllama::state::AppState;

fn test_config_json(runner_port: u16, runner_path: &str) -> String {
    format!(
        r#"{{
            "api": {{"host": "127.0.0.1", "port": 8080}},
            "retry_config": {{
                "max_retries": 0,
                "base_delay_seconds": 0,
                "max_delay_seconds": 0,
                "retry_on_model_loading": false
            }},
            "auto_start_runners": false,
            "models": [
                {{"model": "/models/alpha.gguf", "model_alias": "alpha", "runner": "main"}},
                {{"model": "/models/beta.gguf", "model_alias": "beta", "runner": "main"}}
            ],
            "main": {{"type": "llama-server", "path": "{runner_path}", "port": {runner_port}}}
        }}"#
    )
}

fn make_app(runner_port: u16, runner_path: &str) -> (Router, tempfile::TempDir) {
    let config = Arc::new(Config::from_json_str(&test_config_json(runner_port, runner_path)).unwrap());
    let tmp = tempfile::tempdir().unwrap();
    let manager = Arc::new(RunnerManager::new(&config, tmp.path()));
    let state = Arc::new(AppState::new(config, manager));
    (api::router(state), tmp)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_models_lists_aliases_in_declared_order() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let response = app
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["alpha", "beta"]);
    assert_eq!(body["data"][0]["object"], "model");
    assert_eq!(body["data"][0]["owned_by"], "user");
}

#[tokio::test]
async fn test_unknown_model_returns_404() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = post_json(
        "/v1/chat/completions",
        &json!({"model": "nope", "messages": []}),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "Model not found: nope");
}

#[tokio::test]
async fn test_malformed_json_returns_400() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "Invalid JSON");
}

#[tokio::test]
async fn test_missing_model_defaults_to_first_alias() {
    // No `model` field: the request resolves to "alpha" and pre-flight tries
    // to start the (non-startable) runner for it.
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = post_json("/v1/chat/completions", &json!({"messages": []}));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "model_not_ready");
    assert_eq!(
        body["error"]["message"],
        "Model not ready: Failed to start model: alpha"
    );
}

#[tokio::test]
async fn test_preflight_failure_returns_model_not_ready() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = post_json(
        "/v1/embeddings",
        &json!({"model": "beta", "input": "hello"}),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "model_not_ready");
}

#[tokio::test]
async fn test_runners_status_shape() {
    let (app, _tmp) = make_app(9301, "/nonexistent/llama-server");
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/runners/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    let main = &body["runners"]["main"];
    assert_eq!(main["is_running"], false);
    assert_eq!(main["current_model"], Value::Null);
    assert_eq!(main["available_models"], json!(["alpha", "beta"]));
    assert_eq!(main["port"], 9301);
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_control_plane_rejects_unknown_runner() {
    for action in ["start", "stop", "restart"] {
        let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
        let request = Request::builder()
            .method("POST")
            .uri(format!("/v1/runners/ghost/{action}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND, "action {action}");
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["message"], "Unknown runner: ghost");
    }
}

#[tokio::test]
async fn test_stopping_idle_runner_succeeds() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = Request::builder()
        .method("POST")
        .uri("/v1/runners/main/stop")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["action"], "stop");
    assert_eq!(body["runner_name"], "main");
}

#[tokio::test]
async fn test_start_failure_reports_runner_error() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = Request::builder()
        .method("POST")
        .uri("/v1/runners/main/start")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["type"], "runner_error");
    assert_eq!(body["error"]["message"], "Failed to start runner: main");
}

#[tokio::test]
async fn test_restart_of_nonstartable_runner_fails_after_stop() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = Request::builder()
        .method("POST")
        .uri("/v1/runners/main/restart")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    // Stop succeeds (idle), the start leg fails.
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "Failed to restart runner: main");
}

#[tokio::test]
async fn test_aggregate_health_for_idle_fleet() {
    let (app, _tmp) = make_app(9302, "/nonexistent/llama-server");
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_runners"]["main"], false);
    assert_eq!(body["runner_current_models"]["main"], Value::Null);
    assert_eq!(body["runner_info"]["main"]["port"], 9302);
    assert_eq!(body["runner_info"]["main"]["is_active"], false);
    assert_eq!(body["model_health"]["alpha"]["status"], "not_running");
    assert_eq!(
        body["model_health"]["alpha"]["message"],
        "Runner not running"
    );
    assert_eq!(body["model_health"]["beta"]["status"], "not_running");
}

#[tokio::test]
async fn test_cors_preflight_is_permissive() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/v1/chat/completions")
        .header(header::ORIGIN, "http://example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let (app, _tmp) = make_app(9300, "/nonexistent/llama-server");
    let oversized = vec![b' '; 10 * 1024 * 1024 + 1];
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(oversized))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
