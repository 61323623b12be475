use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-supplied context — a JSON-compatible key-value store. Stages read
/// it freely but may only write keys under the `mutable.` prefix.
pub type Context = HashMap<String, serde_json::Value>;

/// Prefix marking context keys that stages are allowed to update.
pub const MUTABLE_CONTEXT_PREFIX: &str = "mutable.";

/// The six request categories a workflow run can be classified into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Chat,
    Analytics,
    Device,
    Operations,
    Automation,
    Hybrid,
}

impl WorkflowType {
    /// All types, in classification-priority order.
    pub const ALL: [WorkflowType; 6] = [
        WorkflowType::Chat,
        WorkflowType::Analytics,
        WorkflowType::Device,
        WorkflowType::Operations,
        WorkflowType::Automation,
        WorkflowType::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Chat => "chat",
            WorkflowType::Analytics => "analytics",
            WorkflowType::Device => "device",
            WorkflowType::Operations => "operations",
            WorkflowType::Automation => "automation",
            WorkflowType::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(WorkflowType::Chat),
            "analytics" => Ok(WorkflowType::Analytics),
            "device" => Ok(WorkflowType::Device),
            "operations" => Ok(WorkflowType::Operations),
            "automation" => Ok(WorkflowType::Automation),
            "hybrid" => Ok(WorkflowType::Hybrid),
            other => Err(format!("invalid workflow type: {}", other)),
        }
    }
}

/// Status of a workflow run. `Suspended` is the only state a run can be
/// resumed from; the other post-`Running` states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    IterationLimitExceeded,
    Suspended,
}

impl RunStatus {
    /// A terminal run can never transition again; only `Suspended` runs
    /// re-enter `Running` via resume.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::TimedOut
                | RunStatus::IterationLimitExceeded
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::TimedOut => write!(f, "timed_out"),
            RunStatus::IterationLimitExceeded => write!(f, "iteration_limit_exceeded"),
            RunStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// Who produced a message in the run transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Stage,
    System,
}

/// One entry in the append-only run transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            stage: None,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stage(stage: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::Stage,
            stage: Some(stage.to_string()),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            stage: None,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Mutable record threaded through a single workflow run. Owned exclusively
/// by the engine invocation executing it; handed to the checkpoint store
/// only as an opaque snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub workflow_type: WorkflowType,
    pub original_request: String,
    pub messages: Vec<Message>,
    pub stage_results: HashMap<String, serde_json::Value>,
    pub context: Context,
    pub error_count: u32,
    pub current_iteration: u32,
    pub max_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
}

impl WorkflowState {
    pub fn new(
        workflow_type: WorkflowType,
        request: &str,
        context: Context,
        max_iterations: u32,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            workflow_type,
            original_request: request.to_string(),
            messages: vec![Message::user(request)],
            stage_results: HashMap::new(),
            context,
            error_count: 0,
            current_iteration: 0,
            max_iterations,
            final_response: None,
        }
    }
}

/// Output returned by one stage invocation, merged into the run state by the
/// engine. `context_updates` outside the `mutable.` prefix are discarded.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub result: serde_json::Value,
    pub messages: Vec<Message>,
    pub final_response: Option<String>,
    pub context_updates: Context,
}

impl StageOutput {
    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }
}

/// Final product of an engine run: the terminal status plus the state as it
/// stood when the run ended, so callers can extract partial results.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub state: WorkflowState,
}

/// Intermediate stage result published on the progress channel after each
/// completed stage, independent of the final return value.
#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub session_id: String,
    pub stage: String,
    pub iteration: u32,
    pub result: serde_json::Value,
}

/// Cooperative cancellation flag. Cancelling never interrupts a stage in
/// flight; the engine checks the flag between stages and suspends with a
/// checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine tuning knobs. The defaults are starting points, not contracts —
/// every limit is explicit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persist a checkpoint every N completed stages.
    pub checkpoint_interval: u32,
    /// Hard ceiling on successful stage executions per run.
    pub max_iterations: u32,
    /// Per-stage timeout; an expired stage counts as a failed attempt.
    pub stage_timeout_s: f64,
    /// Whole-run watchdog timeout.
    pub workflow_timeout_s: f64,
    /// Retries per stage after the first failed attempt.
    pub max_stage_retries: u32,
    /// Initial retry backoff in seconds (doubles each attempt).
    pub retry_backoff_s: f64,
    /// Concurrency cap for hybrid fan-out.
    pub max_concurrent_stages: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let max_concurrent_stages = std::env::var("STAGEFLOW_MAX_CONCURRENT_STAGES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(num_cpus::get);

        Self {
            checkpoint_interval: 5,
            max_iterations: 10,
            stage_timeout_s: 30.0,
            workflow_timeout_s: 300.0,
            max_stage_retries: 1,
            retry_backoff_s: 1.0,
            max_concurrent_stages,
        }
    }
}
