use thiserror::Error;

use crate::engine::types::RunStatus;

/// Run-level and registration-level failures of the workflow engine.
///
/// Stage-level failures are absorbed inside the engine and converted into
/// routing decisions; only these variants ever propagate to callers.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("graph '{graph}' references unknown stage '{stage}'")]
    UnknownStage { graph: String, stage: String },

    #[error("invalid workflow graph '{graph}': {reason}")]
    GraphValidation { graph: String, reason: String },

    #[error("state type '{state}' does not match graph type '{graph}'")]
    TypeMismatch { state: String, graph: String },

    #[error("session '{session_id}' is {status} and cannot be resumed")]
    NotResumable {
        session_id: String,
        status: RunStatus,
    },
}
