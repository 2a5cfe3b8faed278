//! Configuration loading and validation.
//!
//! The gateway is configured by a single JSON document. Besides the fixed
//! sections (`api`, `models`, `retry_config`, `auto_start_runners`), every
//! remaining top-level key whose value is an object defines one runner, keyed
//! by its name. All validation failures are fatal at startup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

/// Top-level keys that are not runner definitions. `host`/`port` are legacy
/// aliases for the API bind address and are skipped when present.
const RESERVED_KEYS: [&str; 6] = [
    "models",
    "host",
    "port",
    "api",
    "auto_start_runners",
    "retry_config",
];

/// Errors produced while loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Bind address of the gateway's own HTTP API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Route path of the aggregate health endpoint.
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
}

/// Backoff policy for the pre-flight readiness loop.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_true")]
    pub retry_on_model_loading: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_seconds: default_base_delay(),
            max_delay_seconds: default_max_delay(),
            retry_on_model_loading: true,
        }
    }
}

/// One supervised worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Runner kind, e.g. "llama-server". Doubles as the executable when
    /// `path` is omitted.
    #[serde(rename = "type")]
    pub runner_type: Option<String>,
    /// Executable invocation. May carry leading `NAME=VALUE` assignments or
    /// an `env` wrapper; both are accepted for back-compat and warned about.
    pub path: Option<String>,
    /// Bind host for the worker. Defaults to the API host.
    pub host: Option<String>,
    /// Bind port for the worker. Unique across runners.
    pub port: u16,
    /// Arguments appended verbatim after all mapped flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Environment overrides applied to the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Whether the worker inherits the gateway's environment.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
}

impl RunnerConfig {
    /// The raw executable invocation, falling back to the runner type for
    /// older configs that only declare `type`.
    pub fn executable(&self) -> &str {
        self.path
            .as_deref()
            .or(self.runner_type.as_deref())
            .unwrap_or_default()
    }
}

/// One model placement: a model file served by a named runner.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Path to the model file.
    pub model: String,
    /// Name of the runner that serves this model.
    pub runner: String,
    /// Human-facing alias; defaults to the model file's basename.
    pub model_alias: Option<String>,
    pub mmproj: Option<String>,
    pub n_ctx: Option<u64>,
    pub n_batch: Option<u64>,
    pub n_threads: Option<u64>,
    pub chat_template: Option<String>,
    pub split_mode: Option<String>,
    #[serde(default)]
    pub embedding: bool,
    #[serde(default)]
    pub reranking: bool,
    /// KV offload defaults to on; only an explicit `false` emits the flag.
    pub offload_kqv: Option<bool>,
    #[serde(default)]
    pub jinja: bool,
    pub pooling: Option<String>,
    /// Value-bearing, passed through as-is.
    pub flash_attn: Option<String>,
    #[serde(default)]
    pub use_mlock: bool,
    pub main_gpu: Option<i64>,
    pub tensor_split: Option<Vec<f64>>,
    pub n_gpu_layers: Option<i64>,
    #[serde(rename = "cache-type-k")]
    pub cache_type_k: Option<String>,
    #[serde(rename = "cache-type-v")]
    pub cache_type_v: Option<String>,
    #[serde(rename = "rope-scaling")]
    pub rope_scaling: Option<String>,
    #[serde(rename = "rope-scale")]
    pub rope_scale: Option<f64>,
    #[serde(rename = "yarn-orig-ctx")]
    pub yarn_orig_ctx: Option<u64>,
    /// Free-form arguments, shell-split and appended after mapped flags.
    pub args: Option<String>,
    /// Per-model environment overrides; win over the runner's `env`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-model override of the runner's `inherit_env`.
    pub inherit_env: Option<bool>,
}

impl ModelConfig {
    /// The alias clients use to address this model.
    pub fn alias(&self) -> String {
        match &self.model_alias {
            Some(alias) => alias.clone(),
            None => Path::new(&self.model)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.model.clone()),
        }
    }
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    /// Models in declaration order. Order matters: a runner's first declared
    /// model is what it auto-starts with, and the first model overall is the
    /// default when a request omits `model`.
    pub models: Vec<ModelConfig>,
    pub retry: RetryPolicy,
    pub auto_start_runners: bool,
    pub runners: BTreeMap<String, RunnerConfig>,
}

impl Config {
    /// Load and validate the configuration from a JSON file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            return Err(ConfigError::NotFound(path.to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let doc: Value = serde_json::from_str(raw)?;
        let Value::Object(doc) = doc else {
            return Err(ConfigError::Invalid(
                "Configuration must be a JSON object".to_string(),
            ));
        };

        let api: ApiConfig = match doc.get("api") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ConfigError::Invalid(format!("Invalid API configuration: {e}")))?,
            None => {
                return Err(ConfigError::Invalid(
                    "API configuration missing required field: api".to_string(),
                ))
            }
        };

        let models: Vec<ModelConfig> = match doc.get("models") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ConfigError::Invalid(format!("Invalid model configuration: {e}")))?,
            None => {
                return Err(ConfigError::Invalid(
                    "Missing required field: models".to_string(),
                ))
            }
        };

        let retry: RetryPolicy = match doc.get("retry_config") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ConfigError::Invalid(format!("Invalid retry configuration: {e}")))?,
            None => RetryPolicy::default(),
        };

        let auto_start_runners = match doc.get("auto_start_runners") {
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "auto_start_runners must be a boolean".to_string(),
                ))
            }
            None => true,
        };

        let mut runners = BTreeMap::new();
        for (key, value) in &doc {
            if RESERVED_KEYS.contains(&key.as_str()) || !value.is_object() {
                continue;
            }
            let runner: RunnerConfig = serde_json::from_value(value.clone())
                .map_err(|e| ConfigError::Invalid(format!("Runner {key}: {e}")))?;
            runners.insert(key.clone(), runner);
        }

        let config = Self {
            api,
            models,
            retry,
            auto_start_runners,
            runners,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::Invalid(
                "Configuration must contain at least one model".to_string(),
            ));
        }

        let mut seen_aliases = HashSet::new();
        for (index, model) in self.models.iter().enumerate() {
            if !self.runners.contains_key(&model.runner) {
                return Err(ConfigError::Invalid(format!(
                    "Model {index}: Referenced runner '{}' not found in configuration",
                    model.runner
                )));
            }
            let alias = model.alias();
            if !seen_aliases.insert(alias.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "Model {index}: Duplicate model alias: {alias}"
                )));
            }
        }

        let mut used_ports = HashSet::new();
        for (name, runner) in &self.runners {
            if runner.executable().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Runner {name}: Missing required field: path"
                )));
            }
            if !used_ports.insert(runner.port) {
                return Err(ConfigError::Invalid(format!(
                    "Runner {name}: Port {} already in use",
                    runner.port
                )));
            }
        }

        if self.retry.base_delay_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "base_delay_seconds must be a non-negative number".to_string(),
            ));
        }
        if self.retry.max_delay_seconds < self.retry.base_delay_seconds {
            return Err(ConfigError::Invalid(
                "max_delay_seconds must be greater than or equal to base_delay_seconds".to_string(),
            ));
        }

        Ok(())
    }

    /// All model aliases in declaration order.
    pub fn model_aliases(&self) -> Vec<String> {
        self.models.iter().map(ModelConfig::alias).collect()
    }

    pub fn model_by_alias(&self, alias: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.alias() == alias)
    }

    /// Alias-to-runner-name mapping.
    pub fn model_runner_map(&self) -> HashMap<String, String> {
        self.models
            .iter()
            .map(|m| (m.alias(), m.runner.clone()))
            .collect()
    }

    /// The bind host of a runner, defaulting to the API host.
    pub fn runner_host(&self, name: &str) -> &str {
        self.runners
            .get(name)
            .and_then(|r| r.host.as_deref())
            .unwrap_or(&self.api.host)
    }

    /// Models assigned to a runner, in declaration order.
    pub fn models_for_runner(&self, name: &str) -> Vec<&ModelConfig> {
        self.models.iter().filter(|m| m.runner == name).collect()
    }
}

// Default values
fn default_health_endpoint() -> String {
    "/health".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay() -> f64 {
    2.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_true() -> bool {
    true
}
