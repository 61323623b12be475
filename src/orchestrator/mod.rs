pub mod classify;
pub mod legacy;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::engine::WorkflowEngine;
use crate::engine::error::WorkflowError;
use crate::engine::graph::GraphRegistry;
use crate::engine::types::{
    CancelHandle, Context, EngineConfig, RunOutcome, RunStatus, WorkflowState, WorkflowType,
};
use crate::orchestrator::classify::{KeywordClassifier, RequestClassifier};
use crate::orchestrator::legacy::{LegacyOrchestrator, SinglePassOrchestrator};
use crate::stages::StageRegistry;

/// Which fallback level produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The graph engine ran to completion.
    Workflow,
    /// The single-pass legacy orchestrator answered.
    Legacy,
    /// Both tiers failed; a static error response was produced.
    Static,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Workflow => write!(f, "workflow"),
            Tier::Legacy => write!(f, "legacy"),
            Tier::Static => write!(f, "static"),
        }
    }
}

/// What `process` and `resume` hand back. Always produced, never raised:
/// the tier marker tells callers whether the answer is degraded, and any
/// stage results accumulated before a failure ride along.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResponse {
    pub tier: Tier,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<WorkflowType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub stage_results: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<DateTime<Utc>>,
}

/// Availability probe for the primary graph backend, checked once per
/// `process` call before the engine is attempted.
pub trait DependencyProbe: Send + Sync {
    fn is_primary_backend_available(&self) -> bool;
}

/// Default probe: the built-in graph backend is compiled in.
pub struct AlwaysAvailable;

impl DependencyProbe for AlwaysAvailable {
    fn is_primary_backend_available(&self) -> bool {
        true
    }
}

/// Fixed-answer probe for tests and forced-degradation setups.
pub struct StaticProbe(pub bool);

impl DependencyProbe for StaticProbe {
    fn is_primary_backend_available(&self) -> bool {
        self.0
    }
}

struct SessionEntry {
    status: RunStatus,
    cancel: Option<CancelHandle>,
}

const STATIC_ERROR_RESPONSE: &str =
    "The assistant is temporarily unable to process this request. Please try again shortly.";

/// Entry point for the platform: classifies requests, runs the engine, and
/// applies the fallback policy. Constructed once at process start and passed
/// to every caller — there are no ambient singletons.
pub struct Orchestrator {
    engine: WorkflowEngine,
    stages: Arc<StageRegistry>,
    graphs: Arc<GraphRegistry>,
    store: Arc<dyn CheckpointStore>,
    classifier: Box<dyn RequestClassifier>,
    probe: Box<dyn DependencyProbe>,
    legacy: Box<dyn LegacyOrchestrator>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl Orchestrator {
    pub fn new(
        engine: WorkflowEngine,
        stages: Arc<StageRegistry>,
        graphs: Arc<GraphRegistry>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            engine,
            stages,
            graphs,
            store,
            classifier: Box::new(KeywordClassifier),
            probe: Box::new(AlwaysAvailable),
            legacy: Box::new(SinglePassOrchestrator),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Assemble the full built-in stack: builtin stage handlers, the six
    /// validated graphs, and an engine over the given store.
    pub fn builtin(
        store: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Result<Self, WorkflowError> {
        let stages = Arc::new(StageRegistry::with_builtins());
        let graphs = Arc::new(GraphRegistry::with_builtins(&stages)?);
        let engine = WorkflowEngine::new(stages.clone(), store.clone()).with_config(config);
        Ok(Self::new(engine, stages, graphs, store))
    }

    pub fn with_classifier(mut self, classifier: Box<dyn RequestClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn DependencyProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_legacy(mut self, legacy: Box<dyn LegacyOrchestrator>) -> Self {
        self.legacy = legacy;
        self
    }

    /// Attach a progress channel to the underlying engine.
    pub fn with_progress(
        mut self,
        progress: tokio::sync::mpsc::UnboundedSender<crate::engine::types::StageProgress>,
    ) -> Self {
        self.engine = self.engine.with_progress(progress);
        self
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn stages(&self) -> &StageRegistry {
        &self.stages
    }

    pub fn graphs(&self) -> &GraphRegistry {
        &self.graphs
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Registered workflow types.
    pub fn workflow_types(&self) -> Vec<WorkflowType> {
        self.graphs.types()
    }

    /// Process one request. Never fails: every path yields a response
    /// tagged with the tier that produced it.
    pub async fn process(
        &self,
        request: &str,
        context: Context,
        hint: Option<WorkflowType>,
    ) -> OrchestratorResponse {
        let workflow_type = hint.unwrap_or_else(|| self.classifier.classify(request, &context));
        info!(
            workflow = %workflow_type,
            hinted = hint.is_some(),
            "Processing request"
        );

        // Tier 1 precondition: is the graph backend there at all?
        if !self.probe.is_primary_backend_available() {
            warn!("Primary workflow backend unavailable — skipping to legacy orchestrator");
            return self
                .fallback(
                    request,
                    &context,
                    HashMap::new(),
                    "primary workflow backend unavailable",
                )
                .await;
        }

        let graph = match self.graphs.resolve(workflow_type) {
            Ok(graph) => graph,
            Err(e) => {
                return self
                    .fallback(request, &context, HashMap::new(), &e.to_string())
                    .await;
            }
        };

        let state = WorkflowState::new(
            workflow_type,
            request,
            context.clone(),
            self.engine.config().max_iterations,
        );
        let session_id = state.session_id.clone();
        let cancel = CancelHandle::new();
        self.sessions.write().await.insert(
            session_id.clone(),
            SessionEntry {
                status: RunStatus::Running,
                cancel: Some(cancel.clone()),
            },
        );

        let outcome = self.engine.run_with_control(&graph, state, cancel).await;
        self.finish(session_id, request, &context, outcome).await
    }

    /// Resume a suspended session from its checkpoint. A missing checkpoint
    /// comes back as a typed static-tier response, not an error.
    pub async fn resume(&self, session_id: &str) -> OrchestratorResponse {
        if let Some(entry) = self.sessions.read().await.get(session_id)
            && entry.status.is_terminal()
        {
            return self.static_response(format!(
                "session '{}' is {} and cannot be resumed",
                session_id, entry.status
            ));
        }

        let checkpoint = match self.store.load(session_id).await {
            Ok(checkpoint) => checkpoint,
            Err(CheckpointError::NotFound(_)) => {
                return self
                    .static_response(format!("no checkpoint found for session '{}'", session_id));
            }
            Err(e) => {
                error!(session = %session_id, error = %e, "Failed to load checkpoint");
                return self.static_response(e.to_string());
            }
        };

        let graph = match self.graphs.resolve(checkpoint.state.workflow_type) {
            Ok(graph) => graph,
            Err(e) => return self.static_response(e.to_string()),
        };

        let request = checkpoint.state.original_request.clone();
        let context = checkpoint.state.context.clone();
        let cancel = CancelHandle::new();
        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionEntry {
                status: RunStatus::Running,
                cancel: Some(cancel.clone()),
            },
        );

        let outcome = self
            .engine
            .resume_with_control(&graph, checkpoint, cancel)
            .await;
        self.finish(session_id.to_string(), &request, &context, outcome)
            .await
    }

    /// Request cooperative cancellation of an active run. Returns whether a
    /// run was signalled; the run suspends before its next stage.
    pub async fn cancel(&self, session_id: &str) -> bool {
        if let Some(entry) = self.sessions.read().await.get(session_id)
            && let Some(cancel) = &entry.cancel
        {
            cancel.cancel();
            return true;
        }
        false
    }

    /// Current status of a session, if this process has seen it or a
    /// checkpoint survives for it.
    pub async fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        let status = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.status);
        let last_checkpoint = self.store.last_saved(session_id).await.ok().flatten();

        match (status, last_checkpoint) {
            (Some(status), last_checkpoint) => Some(SessionStatus {
                session_id: session_id.to_string(),
                status,
                last_checkpoint,
            }),
            // Unknown to this process but checkpointed: suspended, resumable
            (None, Some(last)) => Some(SessionStatus {
                session_id: session_id.to_string(),
                status: RunStatus::Suspended,
                last_checkpoint: Some(last),
            }),
            (None, None) => None,
        }
    }

    async fn finish(
        &self,
        session_id: String,
        request: &str,
        context: &Context,
        outcome: Result<RunOutcome, WorkflowError>,
    ) -> OrchestratorResponse {
        match outcome {
            Ok(outcome) => {
                self.record_session(&session_id, outcome.status).await;
                match outcome.status {
                    RunStatus::Completed => OrchestratorResponse {
                        tier: Tier::Workflow,
                        response: outcome
                            .state
                            .final_response
                            .clone()
                            .unwrap_or_else(|| "Workflow completed.".to_string()),
                        session_id: Some(session_id),
                        workflow_type: Some(outcome.state.workflow_type),
                        status: Some(RunStatus::Completed),
                        stage_results: outcome.state.stage_results,
                        error: None,
                    },
                    RunStatus::Suspended => OrchestratorResponse {
                        tier: Tier::Workflow,
                        response: format!(
                            "Workflow suspended; resume with session id {}",
                            session_id
                        ),
                        session_id: Some(session_id),
                        workflow_type: Some(outcome.state.workflow_type),
                        status: Some(RunStatus::Suspended),
                        stage_results: outcome.state.stage_results,
                        error: None,
                    },
                    status => {
                        warn!(
                            session = %session_id,
                            status = %status,
                            "Workflow run degraded — falling back"
                        );
                        let mut response = self
                            .fallback(
                                request,
                                context,
                                outcome.state.stage_results,
                                &format!("workflow run ended with status {}", status),
                            )
                            .await;
                        response.session_id = Some(session_id);
                        response.workflow_type = Some(outcome.state.workflow_type);
                        response.status = Some(status);
                        response
                    }
                }
            }
            Err(e) => {
                self.record_session(&session_id, RunStatus::Failed).await;
                warn!(session = %session_id, error = %e, "Workflow engine rejected the run");
                let mut response = self
                    .fallback(request, context, HashMap::new(), &e.to_string())
                    .await;
                response.session_id = Some(session_id);
                response.status = Some(RunStatus::Failed);
                response
            }
        }
    }

    /// Tiers 2 and 3: the legacy single-pass orchestrator, then the static
    /// error response. Partial stage results always ride along so completed
    /// work is not discarded.
    async fn fallback(
        &self,
        request: &str,
        context: &Context,
        partial_results: HashMap<String, serde_json::Value>,
        reason: &str,
    ) -> OrchestratorResponse {
        match self.legacy.process(request, context).await {
            Ok(text) => OrchestratorResponse {
                tier: Tier::Legacy,
                response: text,
                session_id: None,
                workflow_type: None,
                status: None,
                stage_results: partial_results,
                error: Some(reason.to_string()),
            },
            Err(e) => {
                error!(error = %format!("{:#}", e), "Legacy orchestrator failed");
                OrchestratorResponse {
                    tier: Tier::Static,
                    response: STATIC_ERROR_RESPONSE.to_string(),
                    session_id: None,
                    workflow_type: None,
                    status: None,
                    stage_results: partial_results,
                    error: Some(format!("{}; legacy orchestrator failed: {:#}", reason, e)),
                }
            }
        }
    }

    fn static_response(&self, detail: impl Into<String>) -> OrchestratorResponse {
        OrchestratorResponse {
            tier: Tier::Static,
            response: STATIC_ERROR_RESPONSE.to_string(),
            session_id: None,
            workflow_type: None,
            status: None,
            stage_results: HashMap::new(),
            error: Some(detail.into()),
        }
    }

    async fn record_session(&self, session_id: &str, status: RunStatus) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                status,
                cancel: None,
            },
        );
    }
}
