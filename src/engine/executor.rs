use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::engine::error::WorkflowError;
use crate::engine::graph::{Route, WorkflowGraph};
use crate::engine::types::*;
use crate::stages::{StageHandler, StageRegistry};

/// The core workflow execution engine.
///
/// Runs a [`WorkflowGraph`] against a [`WorkflowState`], advancing stage by
/// stage, persisting checkpoints at stage boundaries, and enforcing the
/// iteration ceiling and the per-stage and per-run timeouts.
pub struct WorkflowEngine {
    stages: Arc<StageRegistry>,
    store: Arc<dyn CheckpointStore>,
    config: EngineConfig,
    progress: Option<mpsc::UnboundedSender<StageProgress>>,
}

impl WorkflowEngine {
    pub fn new(stages: Arc<StageRegistry>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            stages,
            store,
            config: EngineConfig::default(),
            progress: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a channel that receives each completed stage's result as soon
    /// as it lands, independent of the final return value.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<StageProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a workflow run from its start stage.
    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        state: WorkflowState,
    ) -> Result<RunOutcome, WorkflowError> {
        self.run_with_control(graph, state, CancelHandle::new())
            .await
    }

    /// Execute a run with a cancellation handle. Cancellation is observed
    /// between stages only; the run suspends with a checkpoint.
    pub async fn run_with_control(
        &self,
        graph: &WorkflowGraph,
        state: WorkflowState,
        cancel: CancelHandle,
    ) -> Result<RunOutcome, WorkflowError> {
        if state.workflow_type != graph.workflow_type() {
            return Err(WorkflowError::TypeMismatch {
                state: state.workflow_type.to_string(),
                graph: graph.workflow_type().to_string(),
            });
        }
        Ok(self
            .execute(graph, state, graph.start().to_string(), cancel)
            .await)
    }

    /// Continue a suspended run from its checkpoint.
    pub async fn resume(
        &self,
        graph: &WorkflowGraph,
        checkpoint: Checkpoint,
    ) -> Result<RunOutcome, WorkflowError> {
        self.resume_with_control(graph, checkpoint, CancelHandle::new())
            .await
    }

    pub async fn resume_with_control(
        &self,
        graph: &WorkflowGraph,
        checkpoint: Checkpoint,
        cancel: CancelHandle,
    ) -> Result<RunOutcome, WorkflowError> {
        if checkpoint.state.workflow_type != graph.workflow_type() {
            return Err(WorkflowError::TypeMismatch {
                state: checkpoint.state.workflow_type.to_string(),
                graph: graph.workflow_type().to_string(),
            });
        }
        if !graph.contains(&checkpoint.stage_name) {
            return Err(WorkflowError::GraphValidation {
                graph: graph.workflow_type().to_string(),
                reason: format!(
                    "checkpoint stage '{}' is not part of the graph",
                    checkpoint.stage_name
                ),
            });
        }

        info!(
            session = %checkpoint.session_id,
            stage = %checkpoint.stage_name,
            "Resuming workflow from checkpoint"
        );
        Ok(self
            .execute(graph, checkpoint.state, checkpoint.stage_name, cancel)
            .await)
    }

    async fn execute(
        &self,
        graph: &WorkflowGraph,
        state: WorkflowState,
        start: String,
        cancel: CancelHandle,
    ) -> RunOutcome {
        let session_id = state.session_id.clone();
        let shared = Arc::new(RwLock::new(state));

        info!(
            session = %session_id,
            workflow = %graph.workflow_type(),
            start = %start,
            "Starting workflow run"
        );

        // Watchdog: the whole run is bounded; on expiry the drive future is
        // dropped between await points and the run is reported as timed out
        let timeout = Duration::from_secs_f64(self.config.workflow_timeout_s);
        let status = tokio::select! {
            status = self.drive(graph, &shared, start, &cancel) => status,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    session = %session_id,
                    timeout_s = self.config.workflow_timeout_s,
                    "Workflow run timed out"
                );
                RunStatus::TimedOut
            }
        };

        let state = shared.read().await.clone();

        // A successful terminal invalidates the recovery checkpoint
        if status == RunStatus::Completed
            && let Err(e) = self.store.invalidate(&session_id).await
        {
            warn!(session = %session_id, error = %e, "Failed to invalidate checkpoint");
        }

        info!(session = %session_id, status = %status, "Workflow run finished");
        RunOutcome { status, state }
    }

    /// The stage loop. Returns the terminal status; the shared state holds
    /// whatever the run produced up to that point.
    async fn drive(
        &self,
        graph: &WorkflowGraph,
        shared: &Arc<RwLock<WorkflowState>>,
        start: String,
        cancel: &CancelHandle,
    ) -> RunStatus {
        let mut current = start;
        let mut since_checkpoint: u32 = 0;

        loop {
            // Cooperative cancellation: observed between stages only
            if cancel.is_cancelled() {
                info!(stage = %current, "Cancellation requested — suspending run");
                self.save_checkpoint(shared, &current).await;
                return RunStatus::Suspended;
            }

            {
                let s = shared.read().await;
                if s.current_iteration >= s.max_iterations {
                    warn!(
                        session = %s.session_id,
                        limit = s.max_iterations,
                        "Iteration limit reached — terminating run"
                    );
                    return RunStatus::IterationLimitExceeded;
                }
            }

            if let Err(reason) = self.execute_stage(&current, shared, true).await {
                return self.fail_run(graph, shared, &current, reason).await;
            }
            since_checkpoint += 1;

            if shared.read().await.final_response.is_some() {
                return RunStatus::Completed;
            }

            let route = {
                let s = shared.read().await;
                graph.resolve_next(&current, &s)
            };

            current = match route {
                Route::End => return RunStatus::Completed,
                Route::Next(next) => next,
                Route::FanOut { stages, then } => {
                    match self.execute_fanout(&stages, shared).await {
                        Ok(completed) => {
                            since_checkpoint += completed;
                            then
                        }
                        Err(reason) => {
                            return self.fail_run(graph, shared, "fan-out", reason).await;
                        }
                    }
                }
            };

            if self.config.checkpoint_interval > 0
                && since_checkpoint >= self.config.checkpoint_interval
            {
                self.save_checkpoint(shared, &current).await;
                since_checkpoint = 0;
            }
        }
    }

    /// Run one stage with bounded retries. Each failed attempt increments
    /// the run's error count; exhausting all attempts fails the stage.
    async fn execute_stage(
        &self,
        name: &str,
        shared: &Arc<RwLock<WorkflowState>>,
        allow_final: bool,
    ) -> Result<(), String> {
        let Some(handler) = self.stages.get(name) else {
            return Err(format!("no handler registered for stage '{}'", name));
        };

        let max_attempts = self.config.max_stage_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let snapshot = shared.read().await.clone();
            info!(
                session = %snapshot.session_id,
                stage = %name,
                attempt,
                max = max_attempts,
                "Running stage"
            );

            match self.invoke_once(handler.as_ref(), &snapshot).await {
                Ok(output) => {
                    self.apply_output(shared, name, output, allow_final).await;
                    return Ok(());
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    shared.write().await.error_count += 1;
                    warn!(stage = %name, attempt, error = %last_error, "Stage attempt failed");

                    if attempt < max_attempts {
                        let delay =
                            self.config.retry_backoff_s * 2.0_f64.powi((attempt - 1) as i32);
                        debug!(stage = %name, delay_s = delay, "Retrying after backoff");
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                }
            }
        }

        Err(format!(
            "stage '{}' failed after {} attempt(s): {}",
            name, max_attempts, last_error
        ))
    }

    /// One handler invocation under the per-stage timeout. A timed-out
    /// stage counts as a failed attempt, not a run-level timeout.
    async fn invoke_once(
        &self,
        handler: &dyn StageHandler,
        state: &WorkflowState,
    ) -> Result<StageOutput> {
        let duration = Duration::from_secs_f64(self.config.stage_timeout_s);
        match tokio::time::timeout(duration, handler.invoke(state)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "stage timed out after {}s",
                self.config.stage_timeout_s
            )),
        }
    }

    /// Run the selected fan-out stages concurrently against one snapshot of
    /// the state, join them, and merge their outputs in stage-name order so
    /// replay is deterministic. Returns the number of stages that completed.
    async fn execute_fanout(
        &self,
        stages: &[String],
        shared: &Arc<RwLock<WorkflowState>>,
    ) -> Result<u32, String> {
        let snapshot = shared.read().await.clone();
        info!(
            session = %snapshot.session_id,
            count = stages.len(),
            "Fanning out domain stages"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_stages));
        let mut handles = Vec::new();

        for name in stages {
            let Some(handler) = self.stages.get(name) else {
                return Err(format!("no handler registered for stage '{}'", name));
            };
            let snapshot = snapshot.clone();
            let semaphore = semaphore.clone();
            let name = name.clone();
            let stage_timeout = self.config.stage_timeout_s;
            let max_attempts = self.config.max_stage_retries + 1;
            let backoff = self.config.retry_backoff_s;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                let mut failures = 0u32;
                let mut last_error = String::new();

                for attempt in 1..=max_attempts {
                    let result = match tokio::time::timeout(
                        Duration::from_secs_f64(stage_timeout),
                        handler.invoke(&snapshot),
                    )
                    .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(anyhow::anyhow!("stage timed out after {}s", stage_timeout)),
                    };

                    match result {
                        Ok(output) => return (name, failures, Ok(output)),
                        Err(e) => {
                            failures += 1;
                            last_error = format!("{:#}", e);
                            warn!(
                                stage = %name,
                                attempt,
                                error = %last_error,
                                "Fan-out stage attempt failed"
                            );
                            if attempt < max_attempts {
                                tokio::time::sleep(Duration::from_secs_f64(
                                    backoff * 2.0_f64.powi((attempt - 1) as i32),
                                ))
                                .await;
                            }
                        }
                    }
                }
                (name, failures, Err(last_error))
            }));
        }

        // The join blocks until every branch completes or times out
        let mut outputs: Vec<(String, StageOutput)> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut total_failures = 0u32;

        for joined in join_all(handles).await {
            match joined {
                Ok((name, failures, Ok(output))) => {
                    total_failures += failures;
                    outputs.push((name, output));
                }
                Ok((name, failures, Err(e))) => {
                    total_failures += failures;
                    failed.push(format!("{}: {}", name, e));
                }
                Err(e) => {
                    failed.push(format!("fan-out task panicked: {}", e));
                }
            }
        }

        if total_failures > 0 {
            shared.write().await.error_count += total_failures;
        }

        // A partial fan-out still synthesizes; only a total failure fails the run
        if outputs.is_empty() {
            return Err(format!("all fan-out stages failed: {}", failed.join("; ")));
        }

        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        let completed = outputs.len() as u32;
        for (name, output) in outputs {
            self.apply_output(shared, &name, output, false).await;
        }

        if !failed.is_empty() {
            let mut s = shared.write().await;
            for f in &failed {
                s.messages.push(Message::system(format!("fan-out stage failed: {}", f)));
            }
        }

        Ok(completed)
    }

    /// Merge a stage's output into the run state. A completed stage's result
    /// is never overwritten; the final response is set at most once; context
    /// writes outside the mutable prefix are dropped.
    async fn apply_output(
        &self,
        shared: &Arc<RwLock<WorkflowState>>,
        stage: &str,
        output: StageOutput,
        allow_final: bool,
    ) {
        {
            let mut s = shared.write().await;
            s.stage_results
                .entry(stage.to_string())
                .or_insert(output.result);
            s.messages.extend(output.messages);

            for (key, value) in output.context_updates {
                if key.starts_with(MUTABLE_CONTEXT_PREFIX) {
                    s.context.insert(key, value);
                } else {
                    warn!(
                        stage = %stage,
                        key = %key,
                        "Ignoring context update outside the mutable prefix"
                    );
                }
            }

            if allow_final
                && let Some(response) = output.final_response
                && s.final_response.is_none()
            {
                s.final_response = Some(response);
            }

            s.current_iteration += 1;
        }

        if let Some(progress) = &self.progress {
            let s = shared.read().await;
            let update = StageProgress {
                session_id: s.session_id.clone(),
                stage: stage.to_string(),
                iteration: s.current_iteration,
                result: s.stage_results.get(stage).cloned().unwrap_or_default(),
            };
            // The consumer may have gone away; progress is advisory
            let _ = progress.send(update);
        }
    }

    /// Terminal failure path: record what happened, give the graph's
    /// error-terminal stage one chance to annotate the state, and fail.
    async fn fail_run(
        &self,
        graph: &WorkflowGraph,
        shared: &Arc<RwLock<WorkflowState>>,
        failed_stage: &str,
        reason: String,
    ) -> RunStatus {
        error!(stage = %failed_stage, error = %reason, "Stage failed — terminating run");
        shared
            .write()
            .await
            .messages
            .push(Message::system(format!(
                "stage '{}' failed: {}",
                failed_stage, reason
            )));

        if let Some(error_stage) = graph.on_error()
            && let Err(e) = self.execute_stage(error_stage, shared, false).await
        {
            warn!(stage = %error_stage, error = %e, "Error-terminal stage also failed");
        }

        RunStatus::Failed
    }

    async fn save_checkpoint(&self, shared: &Arc<RwLock<WorkflowState>>, next_stage: &str) {
        let snapshot = shared.read().await.clone();
        let checkpoint = Checkpoint {
            session_id: snapshot.session_id.clone(),
            stage_name: next_stage.to_string(),
            saved_at: Utc::now(),
            state: snapshot,
        };

        // Checkpointing is best-effort: a write failure never fails the run
        match self.store.save(&checkpoint).await {
            Ok(()) => debug!(
                session = %checkpoint.session_id,
                stage = %next_stage,
                "Checkpoint saved"
            ),
            Err(e) => warn!(
                session = %checkpoint.session_id,
                error = %e,
                "Checkpoint write failed — continuing"
            ),
        }
    }
}
