mod handlers;
mod metrics;
mod problems;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use ctjudge_engine::docker::DockerSandbox;
use ctjudge_engine::engine::{EngineConfig, InMemoryProblems, JudgeEngine, ProblemRepository};
use ctjudge_engine::lang::LanguageRegistry;
use ctjudge_engine::sandbox::{ProcessSandbox, Sandbox};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JudgeEngine>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("CTJudge API booting...");

    let registry = match std::env::var("CTJUDGE_LANGUAGES") {
        Ok(path) => {
            let registry = LanguageRegistry::load_from_file(&path)
                .with_context(|| format!("loading language config from {}", path))?;
            info!(path = %path, "Loaded language configuration");
            registry
        }
        Err(_) => LanguageRegistry::defaults(),
    };
    info!(languages = ?registry.enabled_languages(), "Enabled languages");

    let sandbox = build_sandbox().await?;

    let problem_set = match std::env::var("CTJUDGE_PROBLEMS") {
        Ok(path) => {
            let set = problems::load_from_file(&path)
                .with_context(|| format!("loading problems from {}", path))?;
            info!(path = %path, count = set.len(), "Loaded problem set");
            set
        }
        Err(_) => {
            let set = problems::demo_set();
            info!(count = set.len(), "Using built-in demo problem set");
            set
        }
    };
    let repository: Arc<dyn ProblemRepository> = Arc::new(InMemoryProblems::new(problem_set));

    let worker_count = std::env::var("CTJUDGE_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| EngineConfig::default().worker_count);

    let engine = Arc::new(JudgeEngine::new(
        EngineConfig { worker_count },
        repository,
        registry,
        sandbox,
    ));

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    // Start server
    let addr = std::env::var("CTJUDGE_LISTEN").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Draining judge queue before exit");
    engine.shutdown().await;
    Ok(())
}

/// Sandbox backend selection: in-process by default, Docker when asked for.
async fn build_sandbox() -> Result<Arc<dyn Sandbox>> {
    let backend = std::env::var("CTJUDGE_SANDBOX").unwrap_or_else(|_| "process".to_string());
    match backend.as_str() {
        "docker" => {
            let image = std::env::var("CTJUDGE_IMAGE")
                .unwrap_or_else(|_| "ctjudge-runner:latest".to_string());
            let sandbox = DockerSandbox::new(image.clone())?;
            info!(image = %image, "Using Docker sandbox");
            Ok(Arc::new(sandbox))
        }
        "process" => {
            info!("Using process sandbox");
            Ok(Arc::new(ProcessSandbox::new()))
        }
        other => anyhow::bail!("unknown sandbox backend '{}'", other),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
    }
    info!("Shutdown signal received");
}
