pub mod json_store;
pub mod memory_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::types::WorkflowState;

/// Durable snapshot of a run at a stage boundary. `stage_name` is the stage
/// a resumed run starts from. Only the most recent checkpoint per session is
/// retained — this is a recovery mechanism, not a history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub stage_name: String,
    pub saved_at: DateTime<Utc>,
    pub state: WorkflowState,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found for session '{0}'")]
    NotFound(String),

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Trait for checkpoint persistence. Writes are serialized per session;
/// different sessions may save concurrently.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any prior one for the same session.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Load the latest checkpoint for a session.
    async fn load(&self, session_id: &str) -> Result<Checkpoint, CheckpointError>;

    /// Remove checkpoints older than `max_age_hours`. Returns how many were
    /// removed. Safe to run concurrently with active saves: candidates are
    /// re-verified against their timestamp before deletion.
    async fn cleanup(&self, max_age_hours: f64) -> Result<usize, CheckpointError>;

    /// Drop a session's checkpoint, if any. Called when a run completes.
    async fn invalidate(&self, session_id: &str) -> Result<(), CheckpointError>;

    /// When the session last checkpointed, if it has one.
    async fn last_saved(&self, session_id: &str) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        match self.load(session_id).await {
            Ok(checkpoint) => Ok(Some(checkpoint.saved_at)),
            Err(CheckpointError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// True if a checkpoint saved at `saved_at` has outlived `max_age_hours`.
pub(crate) fn is_stale(saved_at: DateTime<Utc>, now: DateTime<Utc>, max_age_hours: f64) -> bool {
    let age_s = (now - saved_at).num_milliseconds() as f64 / 1000.0;
    age_s > max_age_hours * 3600.0
}
