mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::checkpoint::json_store::JsonCheckpointStore;
use crate::engine::types::EngineConfig;
use crate::orchestrator::Orchestrator;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the API router over an existing orchestrator.
pub fn router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/process", post(handlers::process))
        .route("/sessions/{id}/resume", post(handlers::resume_session))
        .route("/sessions/{id}/status", get(handlers::session_status))
        .route("/sessions/{id}", delete(handlers::cancel_session))
        .route("/workflows", get(handlers::list_workflows))
        .route("/stages", get(handlers::list_stages))
        .route("/checkpoints/cleanup", post(handlers::cleanup_checkpoints))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server with the built-in orchestration stack.
pub async fn serve(
    host: &str,
    port: u16,
    store_dir: PathBuf,
    max_body: usize,
    config: EngineConfig,
) -> Result<()> {
    let store = Arc::new(JsonCheckpointStore::new(store_dir));
    let orchestrator = Arc::new(Orchestrator::builtin(store, config)?);
    let state = Arc::new(AppState { orchestrator });

    let app = router(state, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("stageflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
