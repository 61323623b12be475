use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

use crate::engine::types::{Context, WorkflowType};
use crate::orchestrator::{OrchestratorResponse, SessionStatus};

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct ProcessRequest {
    /// The raw request text to classify and process.
    pub request: String,
    /// Caller-supplied context for the run.
    #[serde(default)]
    pub context: Option<Context>,
    /// Skip classification and force a workflow type.
    #[serde(default)]
    pub workflow_type: Option<String>,
}

#[derive(Serialize)]
pub struct WorkflowInfo {
    pub workflow_type: String,
    pub stages: Vec<String>,
}

#[derive(Serialize)]
pub struct StageInfo {
    pub stage_name: String,
    pub description: String,
}

#[derive(Deserialize)]
pub struct CleanupRequest {
    pub max_age_hours: f64,
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub session_id: String,
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /process
pub async fn process(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessRequest>,
) -> Result<Json<OrchestratorResponse>, AppError> {
    if req.request.trim().is_empty() {
        return Err(AppError::BadRequest("'request' must not be empty".to_string()));
    }

    let hint = match req.workflow_type.as_deref() {
        Some(s) => Some(
            s.parse::<WorkflowType>()
                .map_err(AppError::BadRequest)?,
        ),
        None => None,
    };

    let context = req.context.unwrap_or_default();
    let response = state.orchestrator.process(&req.request, context, hint).await;

    Ok(Json(response))
}

/// POST /sessions/{id}/resume
pub async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<OrchestratorResponse> {
    Json(state.orchestrator.resume(&session_id).await)
}

/// GET /sessions/{id}/status
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    state
        .orchestrator
        .session_status(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Unknown session '{}'", session_id)))
}

/// DELETE /sessions/{id} — cancel an active run and drop its checkpoint.
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = state.orchestrator.cancel(&session_id).await;
    state
        .orchestrator
        .checkpoints()
        .invalidate(&session_id)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(Json(CancelResponse {
        session_id,
        cancelled,
    }))
}

/// GET /workflows
pub async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowInfo>> {
    let orchestrator = &state.orchestrator;
    let workflows = orchestrator
        .workflow_types()
        .into_iter()
        .filter_map(|wt| {
            orchestrator.graphs().resolve(wt).ok().map(|graph| WorkflowInfo {
                workflow_type: wt.to_string(),
                stages: graph.stages().to_vec(),
            })
        })
        .collect();

    Json(workflows)
}

/// GET /stages
pub async fn list_stages(State(state): State<Arc<AppState>>) -> Json<Vec<StageInfo>> {
    let stages = state
        .orchestrator
        .stages()
        .list()
        .into_iter()
        .map(|(name, description)| StageInfo {
            stage_name: name.to_string(),
            description: description.to_string(),
        })
        .collect();

    Json(stages)
}

/// POST /checkpoints/cleanup
pub async fn cleanup_checkpoints(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, AppError> {
    if req.max_age_hours < 0.0 {
        return Err(AppError::BadRequest(
            "'max_age_hours' must be non-negative".to_string(),
        ));
    }

    let removed = state
        .orchestrator
        .checkpoints()
        .cleanup(req.max_age_hours)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(Json(CleanupResponse { removed }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
