use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, is_stale};

/// File-based checkpoint store. Each session's checkpoint is a separate JSON
/// file, written atomically via a temp file and rename.
pub struct JsonCheckpointStore {
    base_dir: PathBuf,
    /// One lock per session serializes that session's writes while leaving
    /// other sessions free to write concurrently.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonCheckpointStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn checkpoint_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", session_id))
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_checkpoint(&self, session_id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.checkpoint_path(session_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let lock = self.session_lock(&checkpoint.session_id).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.base_dir).await?;

        let path = self.checkpoint_path(&checkpoint.session_id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Checkpoint, CheckpointError> {
        self.read_checkpoint(session_id).await
    }

    async fn cleanup(&self, max_age_hours: f64) -> Result<usize, CheckpointError> {
        if !self.base_dir.exists() {
            return Ok(0);
        }

        let now = Utc::now();

        // First pass: snapshot the stale candidates
        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Ok(data) = tokio::fs::read_to_string(&path).await
                && let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&data)
                && is_stale(checkpoint.saved_at, now, max_age_hours)
            {
                candidates.push(checkpoint.session_id);
            }
        }

        // Second pass: re-verify each candidate under its session lock, so
        // a checkpoint written after the scan started is never deleted
        let mut removed = 0;
        for session_id in candidates {
            let lock = self.session_lock(&session_id).await;
            let _guard = lock.lock().await;

            match self.read_checkpoint(&session_id).await {
                Ok(checkpoint) if is_stale(checkpoint.saved_at, now, max_age_hours) => {
                    tokio::fs::remove_file(self.checkpoint_path(&session_id)).await?;
                    debug!(session = %session_id, "Removed stale checkpoint");
                    removed += 1;
                }
                _ => {}
            }
        }

        Ok(removed)
    }

    async fn invalidate(&self, session_id: &str) -> Result<(), CheckpointError> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let path = self.checkpoint_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
