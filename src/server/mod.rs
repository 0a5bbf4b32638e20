//! HTTP surface: projects, messages, GitHub sync and code review.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::agent::{ChatModel, OpenAiChatModel};
use crate::config::VibeConfig;
use crate::review::Reviewer;
use crate::sandbox::provider_from_config;
use crate::store::DbHandle;
use crate::workflow::{CodeAgentWorkflow, Dispatcher, SqliteCheckpointStore};

pub use api::{AppState, SharedState, api_router};

/// Build the application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Wire up storage, sandbox backend, model and dispatcher from configuration.
pub fn build_state(config: VibeConfig) -> Result<SharedState> {
    let config = Arc::new(config);
    let db = DbHandle::open(&config.server.db_path).context("Failed to open application database")?;
    let sandboxes = provider_from_config(&config.sandbox).context("Failed to initialize sandbox backend")?;
    let model: Arc<dyn ChatModel> = Arc::new(
        OpenAiChatModel::new(&config.agent).context("OPENAI_API_KEY is not set")?,
    );

    let workflow = Arc::new(CodeAgentWorkflow::new(
        db.clone(),
        sandboxes,
        model.clone(),
        Arc::new(SqliteCheckpointStore::new(db.clone())),
        config.clone(),
    ));
    let (dispatcher, _loop) = Dispatcher::start(workflow, config.workflow.clone());

    Ok(Arc::new(AppState {
        reviewer: Reviewer::new(model, db.clone()),
        db,
        dispatcher,
        config,
    }))
}

/// Start the server and block until Ctrl+C.
pub async fn start_server(config: VibeConfig) -> Result<()> {
    let dev_mode = config.server.dev_mode;
    let port = config.server.port;
    let state = build_state(config)?;
    let app = build_router(state, dev_mode);

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "Vibe server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
