//! Registry of runner processes and the pre-flight readiness protocol.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{Config, RetryPolicy};
use crate::runner::health::{self, ModelHealth};
use crate::runner::process::RunnerProcess;

/// Total budget for one forwarded inference call.
const FORWARD_TIMEOUT_SECS: u64 = 300;
/// Timeout of a single readiness probe.
const READINESS_PROBE_TIMEOUT_SECS: u64 = 5;
/// How long one readiness attempt waits for the upstream to come up.
const READINESS_WAIT_SECS: u64 = 30;
const READINESS_POLL_INTERVAL_MS: u64 = 500;

/// Snapshot of one runner, as reported by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub is_running: bool,
    pub current_model: Option<String>,
    pub available_models: Vec<String>,
    pub host: String,
    pub port: u16,
}

/// Owns all runner processes and the alias-to-runner index.
pub struct RunnerManager {
    runners: BTreeMap<String, Arc<RunnerProcess>>,
    model_runner_map: HashMap<String, String>,
    /// Aliases in declaration order; the first is the default model.
    aliases: Vec<String>,
    retry: RetryPolicy,
    auto_start: bool,
    client: reqwest::Client,
}

impl RunnerManager {
    pub fn new(config: &Config, session_log_dir: &Path) -> Self {
        let mut runners = BTreeMap::new();
        for (name, runner_config) in &config.runners {
            let host = config.runner_host(name).to_string();
            let models = config
                .models_for_runner(name)
                .into_iter()
                .cloned()
                .collect();
            runners.insert(
                name.clone(),
                Arc::new(RunnerProcess::new(
                    name.clone(),
                    runner_config.clone(),
                    host,
                    session_log_dir,
                    models,
                )),
            );
        }

        let mut aliases = Vec::new();
        let mut model_runner_map = HashMap::new();
        for model in &config.models {
            let alias = model.alias();
            model_runner_map.insert(alias.clone(), model.runner.clone());
            aliases.push(alias);
        }

        Self {
            runners,
            model_runner_map,
            aliases,
            retry: config.retry.clone(),
            auto_start: config.auto_start_runners,
            client: reqwest::Client::new(),
        }
    }

    pub fn runner_names(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }

    pub fn model_aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn model_runner_map(&self) -> &HashMap<String, String> {
        &self.model_runner_map
    }

    pub fn runner(&self, name: &str) -> Option<&Arc<RunnerProcess>> {
        self.runners.get(name)
    }

    /// The runner owning a model alias.
    pub fn runner_for_model(&self, alias: &str) -> Option<&Arc<RunnerProcess>> {
        let name = self.model_runner_map.get(alias)?;
        self.runners.get(name)
    }

    /// Shared HTTP client, also used by the streaming proxy (which must not
    /// carry a total request timeout).
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn start_runner(&self, name: &str) -> bool {
        match self.runners.get(name) {
            Some(runner) => runner.start().await,
            None => {
                tracing::error!("Unknown runner: {name}");
                false
            }
        }
    }

    pub async fn stop_runner(&self, name: &str) -> bool {
        match self.runners.get(name) {
            Some(runner) => runner.stop().await,
            None => {
                tracing::error!("Unknown runner: {name}");
                false
            }
        }
    }

    pub async fn stop_all_runners(&self) -> bool {
        let mut success = true;
        for runner in self.runners.values() {
            if !runner.stop().await {
                success = false;
            }
        }
        success
    }

    /// Ensure the runner owning this alias is live and holding it, switching
    /// models if necessary.
    pub async fn start_runner_for_model(&self, alias: &str) -> bool {
        match self.runner_for_model(alias) {
            Some(runner) => runner.start_with_model(alias).await,
            None => {
                tracing::error!("Unknown model: {alias}");
                false
            }
        }
    }

    /// Start every runner that has models assigned, each with its first
    /// declared model. A failed runner does not abort its peers.
    pub async fn auto_start_default_runners(&self) -> bool {
        if !self.auto_start {
            tracing::info!("Auto-start is disabled, skipping runner auto-start");
            return true;
        }

        tracing::info!("Auto-starting default runners...");
        let mut success = true;
        let mut started = 0usize;
        for (name, runner) in &self.runners {
            let Some(first) = runner.models().first() else {
                tracing::warn!("Runner {name} has no models assigned, skipping auto-start");
                continue;
            };
            tracing::info!("Auto-starting runner {name} with model {}", first.alias());
            if runner.start().await {
                started += 1;
            } else {
                tracing::error!("Failed to auto-start runner {name}");
                success = false;
            }
        }

        if started > 0 {
            tracing::info!("Auto-started {started} runners");
        } else {
            tracing::info!("No runners were auto-started");
        }
        success
    }

    pub async fn is_runner_running(&self, name: &str) -> bool {
        match self.runners.get(name) {
            Some(runner) => runner.is_running().await,
            None => false,
        }
    }

    /// Whether a model is live right now: its runner is up and holds it.
    pub async fn is_model_available(&self, alias: &str) -> bool {
        let Some(runner) = self.runner_for_model(alias) else {
            tracing::error!("Unknown model: {alias}");
            return false;
        };
        runner.is_running().await && runner.is_model_loaded(alias).await
    }

    pub async fn current_model_for_runner(&self, name: &str) -> Option<String> {
        self.runners.get(name)?.current_model_alias().await
    }

    /// Switch between two models on the same runner.
    pub async fn switch_model(&self, from_alias: &str, to_alias: &str) -> bool {
        let Some(from_runner) = self.model_runner_map.get(from_alias) else {
            tracing::error!("Unknown source model: {from_alias}");
            return false;
        };
        let Some(to_runner) = self.model_runner_map.get(to_alias) else {
            tracing::error!("Unknown target model: {to_alias}");
            return false;
        };
        if from_runner != to_runner {
            tracing::error!(
                "Models {from_alias} and {to_alias} are on different runners \
                 ({from_runner} vs {to_runner})"
            );
            return false;
        }
        self.start_runner_for_model(to_alias).await
    }

    /// Status snapshot of every runner.
    pub async fn get_runner_status(&self) -> BTreeMap<String, RunnerStatus> {
        let mut status = BTreeMap::new();
        for (name, runner) in &self.runners {
            status.insert(
                name.clone(),
                RunnerStatus {
                    is_running: runner.is_running().await,
                    current_model: runner.current_model_alias().await,
                    available_models: runner.models().iter().map(|m| m.alias()).collect(),
                    host: runner.host().to_string(),
                    port: runner.port(),
                },
            );
        }
        status
    }

    /// Classify the health of one model placement, probing the upstream only
    /// when the runner is up and actually holds the model.
    pub async fn probe_model_health(&self, alias: &str, timeout: Duration) -> ModelHealth {
        let Some(runner) = self.runner_for_model(alias) else {
            return ModelHealth::error(health::NO_RUNNER_AVAILABLE);
        };
        if !runner.is_running().await {
            return ModelHealth::not_running();
        }
        if !runner.is_model_loaded(alias).await {
            return ModelHealth::not_loaded();
        }
        health::probe(&self.client, runner.host(), runner.port(), timeout).await
    }

    /// One live health probe, without mutating any runner state.
    pub async fn check_model_health(&self, alias: &str) -> ModelHealth {
        self.probe_model_health(alias, Duration::from_secs(READINESS_PROBE_TIMEOUT_SECS))
            .await
    }

    /// Make a model ready to serve, retrying with exponential backoff when
    /// the policy allows it. On failure the last readiness message is
    /// returned for the client-facing error.
    pub async fn ensure_model_ready_with_retry(&self, alias: &str) -> Result<(), String> {
        if !self.retry.retry_on_model_loading {
            return self.readiness_attempt(alias).await;
        }

        let mut last_error = match self.readiness_attempt(alias).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        for attempt in 0..self.retry.max_retries {
            let delay = self.delay_for_attempt(attempt);
            tracing::info!(
                "Retrying model readiness check for {alias} (attempt {}/{}) after {:.1}s delay",
                attempt + 2,
                self.retry.max_retries + 1,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;

            match self.readiness_attempt(alias).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }

        tracing::error!(
            "Model readiness check for {alias} failed after {} attempts. Last error: {last_error}",
            self.retry.max_retries + 1
        );
        Err(last_error)
    }

    /// Backoff before retry `attempt + 1`: `base * 2^attempt`, capped.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.retry.base_delay_seconds * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.retry.max_delay_seconds))
    }

    /// One readiness attempt: start the owning runner if needed, give the
    /// upstream time to come up, then take a final health verdict.
    async fn readiness_attempt(&self, alias: &str) -> Result<(), String> {
        if !self.is_model_available(alias).await {
            tracing::info!("Starting runner for model {alias}");
            if !self.start_runner_for_model(alias).await {
                return Err(format!("Failed to start model: {alias}"));
            }
        }

        self.wait_for_model_ready(alias, Duration::from_secs(READINESS_WAIT_SECS))
            .await;

        let verdict = self
            .probe_model_health(alias, Duration::from_secs(READINESS_PROBE_TIMEOUT_SECS))
            .await;
        if verdict.is_ready() {
            tracing::debug!("Model {alias} is ready");
            Ok(())
        } else {
            tracing::info!("Model {alias} not ready: {}", verdict.message);
            Err(verdict.message)
        }
    }

    async fn wait_for_model_ready(&self, alias: &str, max_wait: Duration) {
        let start = Instant::now();
        while start.elapsed() < max_wait {
            let verdict = self
                .probe_model_health(alias, Duration::from_secs(READINESS_PROBE_TIMEOUT_SECS))
                .await;
            if verdict.is_ready() {
                tracing::debug!(
                    "Model {alias} became ready after {:.1}s",
                    start.elapsed().as_secs_f64()
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(READINESS_POLL_INTERVAL_MS)).await;
        }
        tracing::warn!(
            "Model {alias} did not become ready within {}s",
            max_wait.as_secs()
        );
    }

    /// Buffered reverse proxy: POST the body to the runner, decode the reply
    /// as JSON and hand back the upstream status. Assumes pre-flight already
    /// ran; callers get whatever the worker answered.
    pub async fn forward_request(
        &self,
        alias: &str,
        endpoint: &str,
        body: &Value,
    ) -> (StatusCode, Value) {
        let Some(runner) = self.runner_for_model(alias) else {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": {"message": format!("Model not available: {alias}")}}),
            );
        };

        let url = format!("http://{}:{}{}", runner.host(), runner.port(), endpoint);
        let response = match self
            .client
            .post(&url)
            .json(body)
            .timeout(Duration::from_secs(FORWARD_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::error!("Timeout forwarding to {url}");
                return (
                    StatusCode::REQUEST_TIMEOUT,
                    json!({"error": {"message": "Request timeout"}}),
                );
            }
            Err(e) => {
                tracing::error!("Client error forwarding to {url}: {e}");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({"error": {"message": format!("Connection error: {e}")}}),
                );
            }
        };

        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let text = response.text().await.unwrap_or_default();
        let payload = serde_json::from_str::<Value>(&text)
            .unwrap_or_else(|_| json!({"error": {"message": format!("Invalid response: {text}")}}));
        (status, payload)
    }
}
