//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::runner::RunnerManager;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<RunnerManager>,
}

impl AppState {
    pub fn new(config: Arc<Config>, manager: Arc<RunnerManager>) -> Self {
        Self { config, manager }
    }
}
