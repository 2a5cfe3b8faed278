//! FlexLLama - multi-model gateway for llama.cpp server processes.
//!
//! The gateway supervises a fleet of llama-server subprocesses ("runners"),
//! each serving one model at a time from a pre-declared set, and exposes a
//! single OpenAI-compatible HTTP API that routes every request to the runner
//! owning the requested model. When a request targets a model whose runner
//! currently holds a different model, the runner is transparently restarted
//! with the requested one before the request is forwarded.

pub mod api;
pub mod config;
pub mod error;
pub mod runner;
pub mod session;
pub mod state;

pub use config::{Config, ConfigError};
pub use runner::RunnerManager;
pub use state::AppState;
