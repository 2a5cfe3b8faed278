//! Lifecycle of a single llama-server subprocess.
//!
//! A runner owns at most one worker process at a time. Starting with a model,
//! switching models and stopping all happen under the runner's start lock, so
//! concurrent callers serialize and always observe the post-transition state.
//! The worker is spawned into its own process group with stdout/stderr
//! redirected to the runner's append-only log file in the session directory.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Local;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

use crate::config::{ModelConfig, RunnerConfig};
use crate::runner::command;

/// Grace period after spawn before the first liveness check.
const INITIAL_WAIT_SECS: u64 = 2;
/// Readiness probe budget: attempts spaced one second apart.
const READY_PROBE_ATTEMPTS: u32 = 30;
const READY_PROBE_INTERVAL_SECS: u64 = 1;
const CONNECT_TIMEOUT_SECS: u64 = 1;
/// How long a SIGTERM'd process tree gets before SIGKILL.
const TERM_WAIT_SECS: u64 = 3;
/// Pause after reaping so GPU memory is released before a restart.
const GPU_RELEASE_WAIT_MS: u64 = 500;

#[derive(Default)]
struct ProcessState {
    child: Option<Child>,
    current_model: Option<ModelConfig>,
    log_file: Option<std::fs::File>,
}

/// One supervised worker process and its assigned models.
pub struct RunnerProcess {
    name: String,
    config: RunnerConfig,
    host: String,
    port: u16,
    models: Vec<ModelConfig>,
    log_dir: PathBuf,
    /// Serializes start/stop/switch; held for the whole transition so peers
    /// always see the post-transition state.
    start_lock: Mutex<()>,
    state: RwLock<ProcessState>,
}

impl RunnerProcess {
    pub fn new(
        name: String,
        config: RunnerConfig,
        host: String,
        session_log_dir: &Path,
        models: Vec<ModelConfig>,
    ) -> Self {
        let port = config.port;
        Self {
            name,
            config,
            host,
            port,
            models,
            log_dir: session_log_dir.to_path_buf(),
            start_lock: Mutex::new(()),
            state: RwLock::new(ProcessState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Models assigned to this runner, in declaration order.
    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }

    pub fn model_by_alias(&self, alias: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.alias() == alias)
    }

    /// Alias of the currently loaded model, if the runner is live and ready.
    pub async fn current_model_alias(&self) -> Option<String> {
        self.state
            .read()
            .await
            .current_model
            .as_ref()
            .map(ModelConfig::alias)
    }

    pub async fn is_model_loaded(&self, alias: &str) -> bool {
        self.current_model_alias().await.as_deref() == Some(alias)
    }

    /// Whether the worker process is alive. Observing an exit cleans up the
    /// stale state before returning false.
    pub async fn is_running(&self) -> bool {
        if self.state.read().await.child.is_none() {
            return false;
        }
        if let Some(code) = self.observe_exit().await {
            let model = self
                .current_model_alias()
                .await
                .unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(
                "Runner {} has exited with code: {code} (was running model: {model})",
                self.name
            );
            self.clear_state().await;
            return false;
        }
        true
    }

    /// Start the runner with its first declared model.
    pub async fn start(&self) -> bool {
        let Some(model) = self.models.first().cloned() else {
            tracing::error!("Runner {} has no models", self.name);
            return false;
        };

        let _guard = self.start_lock.lock().await;
        if self.is_running().await {
            tracing::info!("Runner {} is already running", self.name);
            return true;
        }
        self.spawn_with_model(&model).await
    }

    /// Ensure the runner is live and holding the model with this alias,
    /// switching away from any other model first.
    pub async fn start_with_model(&self, alias: &str) -> bool {
        let Some(model) = self.model_by_alias(alias).cloned() else {
            tracing::error!("Model {alias} not found in runner {}", self.name);
            return false;
        };

        let _guard = self.start_lock.lock().await;
        if self.is_running().await {
            if self.is_model_loaded(alias).await {
                tracing::info!("Model {alias} is already loaded in runner {}", self.name);
                return true;
            }
            let current = self
                .current_model_alias()
                .await
                .unwrap_or_else(|| "unknown".to_string());
            tracing::info!(
                "Switching runner {} from model {current} to {alias}",
                self.name
            );
            self.stop_locked().await;
        }
        self.spawn_with_model(&model).await
    }

    /// Stop the worker and its descendants. Idempotent.
    pub async fn stop(&self) -> bool {
        let _guard = self.start_lock.lock().await;
        self.stop_locked().await
    }

    /// Spawn the worker and wait for its port to accept connections.
    /// Caller must hold the start lock.
    async fn spawn_with_model(&self, model: &ModelConfig) -> bool {
        let alias = model.alias();
        let (argv, env_from_path) =
            command::build_command(&self.name, &self.config, model, &self.host, self.port);

        if !env_from_path.is_empty() {
            let names: Vec<&str> = env_from_path.keys().map(String::as_str).collect();
            tracing::warn!(
                "Runner {}: inline env assignments in 'path' are deprecated; \
                 please use the runner or model 'env' map. Parsed vars: {}",
                self.name,
                names.join(", ")
            );
        }

        // Names only; values may hold secrets.
        let mut applied_env: Vec<&str> = self
            .config
            .env
            .keys()
            .chain(model.env.keys())
            .chain(env_from_path.keys())
            .map(String::as_str)
            .collect();
        applied_env.sort_unstable();
        applied_env.dedup();
        if !applied_env.is_empty() {
            tracing::info!(
                "Runner {}: applying env vars {}",
                self.name,
                applied_env.join(", ")
            );
        }

        if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
            tracing::error!(
                "Runner {}: failed to create log directory {}: {e}",
                self.name,
                self.log_dir.display()
            );
            return false;
        }
        let log_path = self.log_dir.join(format!("{}.log", self.name));

        tracing::info!("Starting runner {} with model {alias}", self.name);
        tracing::info!("Command: {}", argv.join(" "));
        tracing::info!("Log file: {}", log_path.display());

        // Append mode preserves logs across model switches.
        let mut log_file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(
                    "Runner {}: failed to open log file {}: {e}",
                    self.name,
                    log_path.display()
                );
                return false;
            }
        };
        let _ = writeln!(
            log_file,
            "\n=== Starting with model {alias} at {} ===",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let _ = log_file.flush();

        let (stdout_log, stderr_log) = match (log_file.try_clone(), log_file.try_clone()) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                tracing::error!("Runner {}: failed to clone log file handle", self.name);
                return false;
            }
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true);

        if !command::resolve_inherit_env(&self.config, model) {
            cmd.env_clear();
        }
        for (key, value) in command::overlay_env(&self.config, model, &env_from_path) {
            cmd.env(key, value);
        }

        // The worker gets its own process group so stop() can take down the
        // whole tree, not just the direct child.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    "Failed to create subprocess for runner {}: {e}",
                    self.name
                );
                return false;
            }
        };
        tracing::debug!("Runner {} spawned with pid {:?}", self.name, child.id());

        {
            let mut state = self.state.write().await;
            state.child = Some(child);
            state.log_file = Some(log_file);
            state.current_model = None;
        }

        tokio::time::sleep(Duration::from_secs(INITIAL_WAIT_SECS)).await;
        if let Some(code) = self.observe_exit().await {
            tracing::error!("Runner {} exited with code: {code}", self.name);
            self.clear_state().await;
            return false;
        }

        for _ in 0..READY_PROBE_ATTEMPTS {
            if self.port_accepts_connections().await {
                tracing::info!(
                    "Runner {} started successfully with model {alias}",
                    self.name
                );
                self.state.write().await.current_model = Some(model.clone());
                return true;
            }
            if let Some(code) = self.observe_exit().await {
                tracing::error!("Runner {} exited with code: {code}", self.name);
                self.clear_state().await;
                return false;
            }
            tokio::time::sleep(Duration::from_secs(READY_PROBE_INTERVAL_SECS)).await;
        }

        tracing::error!("Runner {} did not start in time", self.name);
        self.stop_locked().await;
        false
    }

    /// Stop without taking the start lock. Caller must hold it.
    async fn stop_locked(&self) -> bool {
        let (child, current) = {
            let mut state = self.state.write().await;
            let current = state.current_model.as_ref().map(ModelConfig::alias);
            (state.child.take(), current)
        };
        let Some(mut child) = child else {
            tracing::info!("Runner {} is not running", self.name);
            return true;
        };

        tracing::info!(
            "Stopping runner {} (current model: {})",
            self.name,
            current.as_deref().unwrap_or("unknown")
        );

        let exit_code = kill_tree(&mut child).await;
        tracing::info!("Runner {} stopped with exit code: {exit_code}", self.name);

        self.clear_state().await;
        tokio::time::sleep(Duration::from_millis(GPU_RELEASE_WAIT_MS)).await;
        true
    }

    /// Reap the child if it has exited, returning its exit code.
    async fn observe_exit(&self) -> Option<String> {
        let mut state = self.state.write().await;
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                state.child = None;
                Some(exit_code_string(status))
            }
            Err(_) => {
                state.child = None;
                Some("unknown".to_string())
            }
        }
    }

    /// Close the runner log and forget the current model.
    async fn clear_state(&self) {
        let mut state = self.state.write().await;
        state.current_model = None;
        state.log_file = None;
    }

    async fn port_accepts_connections(&self) -> bool {
        let addr = format!("{}:{}", self.host, self.port);
        matches!(
            tokio::time::timeout(
                Duration::from_secs(CONNECT_TIMEOUT_SECS),
                TcpStream::connect(&addr)
            )
            .await,
            Ok(Ok(_))
        )
    }
}

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Terminate a child and its descendants via its process group, escalating
/// from SIGTERM to SIGKILL after a grace period.
async fn kill_tree(child: &mut Child) -> String {
    let Some(pid) = child.id() else {
        // Already reaped.
        return match child.try_wait() {
            Ok(Some(status)) => exit_code_string(status),
            _ => "unknown".to_string(),
        };
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // The child is its own group leader, so pgid == pid.
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);

        let status = match tokio::time::timeout(Duration::from_secs(TERM_WAIT_SECS), child.wait())
            .await
        {
            Ok(result) => result.ok(),
            Err(_) => {
                let _ = killpg(pgid, Signal::SIGKILL);
                child.wait().await.ok()
            }
        };

        // Sweep any descendants that outlived the leader.
        let _ = killpg(pgid, Signal::SIGKILL);

        status
            .map(exit_code_string)
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(unix))]
    {
        let taskkill = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
            .await;
        if taskkill.is_err() {
            let _ = child.kill().await;
        }
        match tokio::time::timeout(Duration::from_secs(TERM_WAIT_SECS), child.wait()).await {
            Ok(Ok(status)) => exit_code_string(status),
            _ => {
                let _ = child.kill().await;
                "unknown".to_string()
            }
        }
    }
}

fn exit_code_string(status: std::process::ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runner(path: &str, port: u16, log_dir: &Path) -> RunnerProcess {
        let config: RunnerConfig = serde_json::from_value(serde_json::json!({
            "path": path,
            "port": port
        }))
        .unwrap();
        let models: Vec<ModelConfig> = vec![
            serde_json::from_value(serde_json::json!({
                "model": "/models/alpha.gguf",
                "model_alias": "alpha",
                "runner": "test"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "model": "/models/beta.gguf",
                "runner": "test"
            }))
            .unwrap(),
        ];
        RunnerProcess::new(
            "test".to_string(),
            config,
            "127.0.0.1".to_string(),
            log_dir,
            models,
        )
    }

    #[tokio::test]
    async fn test_model_lookup_by_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = test_runner("/usr/bin/llama-server", 9100, tmp.path());
        assert!(runner.model_by_alias("alpha").is_some());
        // Second model falls back to its file basename.
        assert!(runner.model_by_alias("beta.gguf").is_some());
        assert!(runner.model_by_alias("gamma").is_none());
    }

    #[tokio::test]
    async fn test_idle_runner_reports_nothing_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = test_runner("/usr/bin/llama-server", 9100, tmp.path());
        assert!(!runner.is_running().await);
        assert!(!runner.is_model_loaded("alpha").await);
        assert_eq!(runner.current_model_alias().await, None);
    }

    #[tokio::test]
    async fn test_start_with_unknown_alias_fails_without_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = test_runner("/nonexistent/llama-server", 9100, tmp.path());
        assert!(!runner.start_with_model("gamma").await);
        assert!(!runner.is_running().await);
        // Nothing was spawned, so no runner log was created.
        assert!(!tmp.path().join("test.log").exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_false_and_keeps_separator() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = test_runner("/nonexistent/llama-server", 9100, tmp.path());
        assert!(!runner.start_with_model("alpha").await);
        assert!(!runner.is_running().await);
        assert_eq!(runner.current_model_alias().await, None);

        let log = std::fs::read_to_string(tmp.path().join("test.log")).unwrap();
        assert!(log.contains("=== Starting with model alpha at "));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = test_runner("/usr/bin/llama-server", 9100, tmp.path());
        assert!(runner.stop().await);
        assert!(runner.stop().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_detects_immediate_child_exit() {
        let tmp = tempfile::tempdir().unwrap();
        // `false` accepts any arguments and exits non-zero right away.
        let runner = test_runner("false", 9100, tmp.path());
        assert!(!runner.start_with_model("alpha").await);
        assert!(!runner.is_running().await);
        assert_eq!(runner.current_model_alias().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_tree_terminates_long_running_child() {
        let start = std::time::Instant::now();
        let mut child = Command::new("sleep")
            .arg("300")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let code = kill_tree(&mut child).await;
        assert!(start.elapsed() < Duration::from_secs(TERM_WAIT_SECS + 2));
        // SIGTERM'd, so no regular exit code.
        assert_eq!(code, "signal");
    }
}
