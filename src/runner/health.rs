//! Upstream health probing and classification.
//!
//! One classification table serves every consumer: the pre-flight readiness
//! loop, the manager's single-model health check, and the aggregate health
//! endpoint. A llama-server that is still loading a model answers 503 with a
//! `{"error": {"message": ...}}` body mentioning "loading"; anything else
//! non-200 is an error.

use std::time::Duration;

use serde::Serialize;

pub const READY: &str = "Ready";
pub const MODEL_LOADING: &str = "Model is still loading";
pub const RUNNER_NOT_RUNNING: &str = "Runner not running";
pub const MODEL_NOT_LOADED: &str = "Model not loaded in runner";
pub const NO_RUNNER_AVAILABLE: &str = "No runner available";
pub const HEALTH_CHECK_TIMEOUT: &str = "Health check timeout";

/// Maximum upstream body length echoed into health messages.
const MESSAGE_BODY_LIMIT: usize = 100;

/// Health verdict for one model placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Loading,
    Error,
    NotRunning,
    NotLoaded,
}

/// Classified health observation, as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ModelHealth {
    pub status: HealthStatus,
    pub message: String,
}

impl ModelHealth {
    pub fn ready() -> Self {
        Self {
            status: HealthStatus::Ok,
            message: READY.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            message: message.into(),
        }
    }

    pub fn not_running() -> Self {
        Self {
            status: HealthStatus::NotRunning,
            message: RUNNER_NOT_RUNNING.to_string(),
        }
    }

    pub fn not_loaded() -> Self {
        Self {
            status: HealthStatus::NotLoaded,
            message: MODEL_NOT_LOADED.to_string(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

/// Probe a runner's `/health` endpoint and classify the reply.
pub async fn probe(
    client: &reqwest::Client,
    host: &str,
    port: u16,
    timeout: Duration,
) -> ModelHealth {
    let url = format!("http://{host}:{port}/health");
    match client.get(&url).timeout(timeout).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            classify_response(status, &body)
        }
        Err(e) if e.is_timeout() => ModelHealth::error(HEALTH_CHECK_TIMEOUT),
        Err(e) => ModelHealth::error(format!("Connection error: {e}")),
    }
}

/// Classify an upstream `/health` reply by status code and body.
pub fn classify_response(status: u16, body: &str) -> ModelHealth {
    if status == 200 {
        return ModelHealth::ready();
    }

    if status == 503 {
        let upstream_message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            });

        return match upstream_message {
            Some(message) if message.to_lowercase().contains("loading") => ModelHealth {
                status: HealthStatus::Loading,
                message,
            },
            Some(message) => ModelHealth::error(message),
            None if body.to_lowercase().contains("loading") => ModelHealth {
                status: HealthStatus::Loading,
                message: MODEL_LOADING.to_string(),
            },
            None => ModelHealth::error(format!("HTTP {status}: {}", truncate(body))),
        };
    }

    ModelHealth::error(format!("HTTP {status}: {}", truncate(body)))
}

fn truncate(body: &str) -> &str {
    let mut end = MESSAGE_BODY_LIMIT.min(body.len());
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_200_is_ready() {
        let health = classify_response(200, "");
        assert_eq!(health.status, HealthStatus::Ok);
        assert_eq!(health.message, READY);
    }

    #[test]
    fn test_503_with_loading_message_is_loading() {
        let body = r#"{"error": {"message": "Loading model"}}"#;
        let health = classify_response(503, body);
        assert_eq!(health.status, HealthStatus::Loading);
        assert_eq!(health.message, "Loading model");
    }

    #[test]
    fn test_503_with_other_message_is_error() {
        let body = r#"{"error": {"message": "CUDA out of memory"}}"#;
        let health = classify_response(503, body);
        assert_eq!(health.status, HealthStatus::Error);
        assert_eq!(health.message, "CUDA out of memory");
    }

    #[test]
    fn test_503_non_json_body_mentioning_loading() {
        let health = classify_response(503, "model is loading, please wait");
        assert_eq!(health.status, HealthStatus::Loading);
        assert_eq!(health.message, MODEL_LOADING);
    }

    #[test]
    fn test_503_non_json_body_is_error_with_excerpt() {
        let health = classify_response(503, "bad gateway");
        assert_eq!(health.status, HealthStatus::Error);
        assert_eq!(health.message, "HTTP 503: bad gateway");
    }

    #[test]
    fn test_other_status_is_error_with_excerpt() {
        let health = classify_response(500, "boom");
        assert_eq!(health.status, HealthStatus::Error);
        assert_eq!(health.message, "HTTP 500: boom");
    }

    #[test]
    fn test_body_excerpt_is_capped_at_100_chars() {
        let body = "x".repeat(250);
        let health = classify_response(500, &body);
        assert_eq!(health.message.len(), "HTTP 500: ".len() + 100);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let health = ModelHealth::not_running();
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "not_running");
        assert_eq!(json["message"], RUNNER_NOT_RUNNING);
    }

    #[tokio::test]
    async fn test_probe_classifies_live_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let port = server.address().port();
        let client = reqwest::Client::new();
        let health = probe(&client, "127.0.0.1", port, Duration::from_secs(3)).await;
        assert!(health.is_ready());
    }

    #[tokio::test]
    async fn test_probe_reports_connection_error_for_dead_upstream() {
        // Grab a free port, then release it so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = reqwest::Client::new();
        let health = probe(&client, "127.0.0.1", port, Duration::from_secs(3)).await;
        assert_eq!(health.status, HealthStatus::Error);
        assert!(health.message.starts_with("Connection error:"));
    }
}
