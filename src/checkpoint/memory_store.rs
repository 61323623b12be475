use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, is_stale};

/// In-memory checkpoint store. Holds checkpoints only for the lifetime of
/// the store instance; used in tests and embedded setups.
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Checkpoint, CheckpointError> {
        self.checkpoints
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(session_id.to_string()))
    }

    async fn cleanup(&self, max_age_hours: f64) -> Result<usize, CheckpointError> {
        let now = Utc::now();
        let mut checkpoints = self.checkpoints.lock().unwrap();

        let stale: Vec<String> = checkpoints
            .iter()
            .filter(|(_, cp)| is_stale(cp.saved_at, now, max_age_hours))
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &stale {
            checkpoints.remove(session_id);
        }

        Ok(stale.len())
    }

    async fn invalidate(&self, session_id: &str) -> Result<(), CheckpointError> {
        self.checkpoints.lock().unwrap().remove(session_id);
        Ok(())
    }
}
