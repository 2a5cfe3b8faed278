//! Session-scoped logging.
//!
//! Every gateway invocation gets its own directory under the log root,
//! holding the gateway's `main.log` and `errors.log` plus one append-only
//! log per started runner. The log root comes from `FLEXLLAMA_LOG_DIR`
//! (default `./logs`); if it is not writable, a per-user directory under the
//! system temp dir is used instead.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

pub const LOG_DIR_ENV: &str = "FLEXLLAMA_LOG_DIR";
const DEFAULT_LOG_DIR: &str = "logs";

/// One gateway invocation's log identity.
pub struct Session {
    pub id: String,
    pub dir: PathBuf,
}

impl Session {
    /// Create the session directory and install the tracing subscriber.
    pub fn start(debug: bool) -> io::Result<Self> {
        let preferred =
            std::env::var(LOG_DIR_ENV).unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string());
        let base = resolve_log_base(Path::new(&preferred));
        let session = Self::create(&base)?;
        session.init_tracing(debug)?;
        Ok(session)
    }

    /// Create a session directory under `base` without touching global
    /// logging state.
    pub fn create(base: &Path) -> io::Result<Self> {
        let id = format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), short_uuid());
        let dir = base.join(&id);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { id, dir })
    }

    /// Install console + file logging. `main.log` captures everything the
    /// active filter lets through; `errors.log` only ERROR events.
    fn init_tracing(&self, debug: bool) -> io::Result<()> {
        let main_log = File::create(self.dir.join("main.log"))?;
        let error_log = File::create(self.dir.join("errors.log"))?;
        let default_level = if debug { "debug" } else { "info" };

        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(main_log)),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(error_log))
                    .with_filter(LevelFilter::ERROR),
            )
            .init();
        Ok(())
    }

    /// Write session metadata next to the logs.
    pub fn write_info(&self, config_path: &str) {
        let info = serde_json::json!({
            "session_id": self.id,
            "start_time": Utc::now().to_rfc3339(),
            "config_file": config_path,
            "platform": std::env::consts::OS,
            "version": env!("CARGO_PKG_VERSION"),
            "log_files": {
                "main_log": "main.log",
                "error_log": "errors.log",
                "runner_logs": "Runner logs (<runner_name>.log) are created when runners start",
            },
        });

        let path = self.dir.join("session_info.json");
        match serde_json::to_string_pretty(&info) {
            Ok(body) => match std::fs::write(&path, body) {
                Ok(()) => tracing::info!("Session info saved to: {}", path.display()),
                Err(e) => tracing::error!("Failed to create session info file: {e}"),
            },
            Err(e) => tracing::error!("Failed to serialize session info: {e}"),
        }
    }
}

/// Pick a writable log base, preferring the configured directory.
fn resolve_log_base(preferred: &Path) -> PathBuf {
    if std::fs::create_dir_all(preferred).is_ok() && dir_is_writable(preferred) {
        return preferred.to_path_buf();
    }

    let fallback = std::env::temp_dir().join(format!("flexllama_logs_{}", user_tag()));
    eprintln!(
        "Warning: Log directory '{}' not writable. Falling back to '{}'.",
        preferred.display(),
        fallback.display()
    );
    let _ = std::fs::create_dir_all(&fallback);
    fallback
}

fn dir_is_writable(dir: &Path) -> bool {
    let probe = dir.join(".write-probe");
    match File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(unix)]
fn user_tag() -> String {
    nix::unistd::Uid::current().to_string()
}

#[cfg(not(unix))]
fn user_tag() -> String {
    std::env::var("USERNAME").unwrap_or_else(|_| "user".to_string())
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
