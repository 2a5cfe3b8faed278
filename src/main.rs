//! FlexLLama entry point.
//!
//! Startup order matters: session logging first (so configuration errors are
//! captured), then configuration, then the HTTP server, and only then the
//! runner auto-start in the background so the API is responsive while models
//! load. Shutdown stops the server before the runners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use flexllama::config::Config;
use flexllama::runner::RunnerManager;
use flexllama::session::Session;
use flexllama::state::AppState;
use flexllama::api;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code for an interactive interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("flexllama {VERSION}");
        return 0;
    }
    let debug = args.iter().any(|a| a == "--debug");
    let Some(config_path) = args.iter().find(|a| !a.starts_with("--")).cloned() else {
        eprintln!("Usage: flexllama [--debug] <config_path>");
        return 1;
    };

    let session = match Session::start(debug) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to initialize session logging: {e}");
            return 1;
        }
    };
    tracing::info!("Session ID: {}", session.id);
    tracing::info!("Session log directory: {}", session.dir.display());

    tracing::info!("Loading configuration from {config_path}");
    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return 1;
        }
    };
    tracing::info!("Configuration validation successful");
    session.write_info(&config_path);

    let manager = Arc::new(RunnerManager::new(&config, &session.dir));
    let state = Arc::new(AppState::new(config.clone(), manager.clone()));
    let app = api::router(state);

    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {addr}: {e}");
            return 1;
        }
    };
    tracing::info!("API server running at http://{addr}");

    // Bring runners up in the background; requests that arrive before a
    // runner is ready go through the pre-flight path anyway.
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.auto_start_default_runners().await;
        });
    }

    tracing::info!("Press Ctrl+C to stop");

    let interrupted = Arc::new(AtomicBool::new(false));
    let shutdown = {
        let interrupted = interrupted.clone();
        async move {
            if wait_for_shutdown_signal().await {
                interrupted.store(true, Ordering::SeqCst);
            }
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {e}");
        manager.stop_all_runners().await;
        return 1;
    }

    tracing::info!("Shutting down...");
    manager.stop_all_runners().await;

    if interrupted.load(Ordering::SeqCst) {
        EXIT_INTERRUPTED
    } else {
        0
    }
}

/// Wait for SIGINT or SIGTERM. Returns true for an interactive interrupt.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT");
                    true
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                    false
                }
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received SIGINT");
            true
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> bool {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received interrupt");
    true
}
