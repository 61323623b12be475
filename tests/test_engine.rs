//! Integration tests for the workflow execution engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use stageflow::checkpoint::CheckpointStore;
use stageflow::checkpoint::memory_store::MemoryCheckpointStore;
use stageflow::engine::WorkflowEngine;
use stageflow::engine::error::WorkflowError;
use stageflow::engine::graph::{GraphRegistry, Route, WorkflowGraph};
use stageflow::engine::types::*;
use stageflow::stages::{StageHandler, StageRegistry};

fn quick_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    }
}

fn builtin_setup() -> (WorkflowEngine, Arc<MemoryCheckpointStore>, GraphRegistry) {
    let stages = Arc::new(StageRegistry::with_builtins());
    let graphs = GraphRegistry::with_builtins(&stages).unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(stages, store.clone()).with_config(quick_config());
    (engine, store, graphs)
}

// --- Test stage handlers ---

struct EchoStage(&'static str);

#[async_trait]
impl StageHandler for EchoStage {
    fn stage_name(&self) -> &str {
        self.0
    }

    fn description(&self) -> &str {
        "test echo stage"
    }

    async fn invoke(&self, _state: &WorkflowState) -> Result<StageOutput> {
        Ok(StageOutput::with_result(serde_json::json!({"echo": self.0})))
    }
}

struct FailingStage(&'static str);

#[async_trait]
impl StageHandler for FailingStage {
    fn stage_name(&self) -> &str {
        self.0
    }

    fn description(&self) -> &str {
        "test stage that always fails"
    }

    async fn invoke(&self, _state: &WorkflowState) -> Result<StageOutput> {
        anyhow::bail!("intentional failure")
    }
}

struct FlakyStage {
    name: &'static str,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StageHandler for FlakyStage {
    fn stage_name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "test stage that fails on its first attempt"
    }

    async fn invoke(&self, _state: &WorkflowState) -> Result<StageOutput> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("first attempt fails")
        }
        Ok(StageOutput::with_result(serde_json::json!({"ok": true})))
    }
}

struct SlowStage(&'static str);

#[async_trait]
impl StageHandler for SlowStage {
    fn stage_name(&self) -> &str {
        self.0
    }

    fn description(&self) -> &str {
        "test stage that sleeps"
    }

    async fn invoke(&self, _state: &WorkflowState) -> Result<StageOutput> {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        Ok(StageOutput::default())
    }
}

fn state_for(workflow_type: WorkflowType, request: &str, max_iterations: u32) -> WorkflowState {
    WorkflowState::new(workflow_type, request, Context::new(), max_iterations)
}

// --- Scenario: device status request ---

#[tokio::test]
async fn device_workflow_runs_both_stages() {
    let (engine, _store, graphs) = builtin_setup();
    let graph = graphs.resolve(WorkflowType::Device).unwrap();
    let state = state_for(WorkflowType::Device, "check the status of device 7", 10);

    let outcome = engine.run(&graph, state).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.error_count, 0);
    assert_eq!(outcome.state.current_iteration, 2);
    assert!(outcome.state.stage_results.contains_key("device_discovery"));
    assert!(outcome.state.stage_results.contains_key("device_status_check"));

    let response = outcome.state.final_response.unwrap();
    assert!(response.contains("device 7"), "got: {}", response);

    // Stage messages land in completion order
    let stage_order: Vec<&str> = outcome
        .state
        .messages
        .iter()
        .filter_map(|m| m.stage.as_deref())
        .collect();
    assert_eq!(stage_order, vec!["device_discovery", "device_status_check"]);
}

#[tokio::test]
async fn chat_workflow_sets_final_response_once() {
    let (engine, _store, graphs) = builtin_setup();
    let graph = graphs.resolve(WorkflowType::Chat).unwrap();
    let state = state_for(WorkflowType::Chat, "hello there", 10);

    let outcome = engine.run(&graph, state).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.final_response.as_deref(), Some("Hello! How can I help you today?"));
}

// --- Hybrid fan-out ---

#[tokio::test]
async fn hybrid_fanout_joins_selected_domains() {
    let (engine, _store, graphs) = builtin_setup();
    let graph = graphs.resolve(WorkflowType::Hybrid).unwrap();
    let state = state_for(WorkflowType::Hybrid, "usage report for device 7", 10);

    let outcome = engine.run(&graph, state).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.state.stage_results.contains_key("router"));
    assert!(outcome.state.stage_results.contains_key("analytics_report"));
    assert!(outcome.state.stage_results.contains_key("device_status_check"));

    // The synthesizer saw both domain entries
    let sources = outcome.state.stage_results["synthesizer"]["sources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert!(sources.contains(&"analytics_report".to_string()));
    assert!(sources.contains(&"device_status_check".to_string()));
}

#[tokio::test]
async fn hybrid_fanout_merge_is_deterministic() {
    let run = || async {
        let (engine, _store, graphs) = builtin_setup();
        let graph = graphs.resolve(WorkflowType::Hybrid).unwrap();
        let state = state_for(WorkflowType::Hybrid, "usage report for device 7", 10);
        let outcome = engine.run(&graph, state).await.unwrap();

        let stage_order: Vec<String> = outcome
            .state
            .messages
            .iter()
            .filter_map(|m| m.stage.clone())
            .collect();
        (outcome.state.final_response.unwrap(), stage_order)
    };

    let (response_a, order_a) = run().await;
    let (response_b, order_b) = run().await;

    // Same inputs, same synthesis, same merge order — regardless of which
    // fanned-out stage finished first
    assert_eq!(response_a, response_b);
    assert_eq!(order_a, order_b);
    assert_eq!(
        order_a,
        vec!["router", "analytics_report", "device_status_check", "synthesizer"]
    );
}

#[tokio::test]
async fn fanout_survives_partial_branch_failure() {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(EchoStage("entry")));
    registry.register(Arc::new(EchoStage("good_branch")));
    registry.register(Arc::new(FailingStage("bad_branch")));
    registry.register(Arc::new(EchoStage("join")));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("entry")
        .route("entry", |_| Route::FanOut {
            stages: vec!["good_branch".to_string(), "bad_branch".to_string()],
            then: "join".to_string(),
        })
        .stage("good_branch")
        .next("good_branch", "join")
        .stage("bad_branch")
        .next("bad_branch", "join")
        .stage("join")
        .end("join")
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store).with_config(EngineConfig {
        max_stage_retries: 0,
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    });

    let state = state_for(WorkflowType::Chat, "fan out", 10);
    let outcome = engine.run(&graph, state).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.state.stage_results.contains_key("good_branch"));
    assert!(!outcome.state.stage_results.contains_key("bad_branch"));
    assert_eq!(outcome.state.error_count, 1);
}

// --- Iteration limit ---

#[tokio::test]
async fn self_routing_stage_hits_iteration_limit() {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(EchoStage("spin")));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("spin")
        .route("spin", |_| Route::Next("spin".to_string()))
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store).with_config(quick_config());

    let state = state_for(WorkflowType::Chat, "loop forever", 3);
    let outcome = engine.run(&graph, state).await.unwrap();

    assert_eq!(outcome.status, RunStatus::IterationLimitExceeded);
    // Terminated at exactly the ceiling, not earlier or later
    assert_eq!(outcome.state.current_iteration, 3);
}

// --- Retry and failure ---

#[tokio::test]
async fn flaky_stage_succeeds_after_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(FlakyStage {
        name: "flaky",
        calls: calls.clone(),
    }));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("flaky")
        .end("flaky")
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store).with_config(EngineConfig {
        max_stage_retries: 1,
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    });

    let outcome = engine
        .run(&graph, state_for(WorkflowType::Chat, "try me", 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.state.error_count, 1);
    assert!(outcome.state.stage_results.contains_key("flaky"));
}

#[tokio::test]
async fn exhausted_retries_fail_the_run_with_partial_results() {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(EchoStage("first")));
    registry.register(Arc::new(FailingStage("second")));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("first")
        .stage("second")
        .next("first", "second")
        .end("second")
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store).with_config(EngineConfig {
        max_stage_retries: 1,
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    });

    let outcome = engine
        .run(&graph, state_for(WorkflowType::Chat, "will fail", 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    // Work completed before the failure is preserved
    assert!(outcome.state.stage_results.contains_key("first"));
    assert_eq!(outcome.state.error_count, 2);
    assert!(outcome.state.final_response.is_none());
}

#[tokio::test]
async fn error_terminal_stage_annotates_failed_run() {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(FailingStage("boom")));
    registry.register(Arc::new(stageflow::stages::builtin::error_report::ErrorReportStage));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("boom")
        .end("boom")
        .stage("error_report")
        .end("error_report")
        .on_error("error_report")
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store).with_config(EngineConfig {
        max_stage_retries: 0,
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    });

    let outcome = engine
        .run(&graph, state_for(WorkflowType::Chat, "explode", 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    let report = &outcome.state.stage_results["error_report"];
    assert_eq!(report["failed"], serde_json::json!(true));
    assert!(report["detail"].as_str().unwrap().contains("boom"));
}

// --- Timeouts ---

#[tokio::test]
async fn slow_stage_times_out_and_fails_run() {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(SlowStage("slow")));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("slow")
        .end("slow")
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store).with_config(EngineConfig {
        stage_timeout_s: 0.05,
        max_stage_retries: 0,
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    });

    let outcome = engine
        .run(&graph, state_for(WorkflowType::Chat, "too slow", 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.state.error_count, 1);
}

#[tokio::test]
async fn workflow_watchdog_reports_timed_out() {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(SlowStage("slow")));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("slow")
        .end("slow")
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store).with_config(EngineConfig {
        workflow_timeout_s: 0.05,
        ..EngineConfig::default()
    });

    let outcome = engine
        .run(&graph, state_for(WorkflowType::Chat, "hang", 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::TimedOut);
}

// --- Checkpointing ---

#[tokio::test]
async fn checkpoint_written_at_interval() {
    let mut registry = StageRegistry::new();
    registry.register(Arc::new(EchoStage("first")));
    registry.register(Arc::new(FailingStage("second")));
    let registry = Arc::new(registry);

    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("first")
        .stage("second")
        .next("first", "second")
        .end("second")
        .build(&registry)
        .unwrap();

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(registry, store.clone()).with_config(EngineConfig {
        checkpoint_interval: 1,
        max_stage_retries: 0,
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    });

    let state = state_for(WorkflowType::Chat, "checkpoint me", 10);
    let session_id = state.session_id.clone();
    let outcome = engine.run(&graph, state).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);

    // The interval checkpoint from after stage one survives the failure,
    // pointing at the stage a resume would retry
    let checkpoint = store.load(&session_id).await.unwrap();
    assert_eq!(checkpoint.stage_name, "second");
    assert!(checkpoint.state.stage_results.contains_key("first"));
}

#[tokio::test]
async fn completed_run_invalidates_checkpoint() {
    let (engine, store, graphs) = builtin_setup();
    let engine = engine.with_config(EngineConfig {
        checkpoint_interval: 1,
        retry_backoff_s: 0.0,
        ..EngineConfig::default()
    });
    let graph = graphs.resolve(WorkflowType::Chat).unwrap();

    let state = state_for(WorkflowType::Chat, "hello", 10);
    let session_id = state.session_id.clone();

    let outcome = engine.run(&graph, state).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(store.load(&session_id).await.is_err());
}

// --- Suspension and resume ---

#[tokio::test]
async fn cancelled_run_suspends_with_checkpoint() {
    let (engine, store, graphs) = builtin_setup();
    let graph = graphs.resolve(WorkflowType::Chat).unwrap();
    let state = state_for(WorkflowType::Chat, "hello", 10);
    let session_id = state.session_id.clone();

    let cancel = CancelHandle::new();
    cancel.cancel();

    let outcome = engine
        .run_with_control(&graph, state, cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Suspended);
    assert_eq!(outcome.state.current_iteration, 0);

    let checkpoint = store.load(&session_id).await.unwrap();
    assert_eq!(checkpoint.stage_name, "chat_intent");
}

#[tokio::test]
async fn suspended_run_resumes_to_completion() {
    let (engine, store, graphs) = builtin_setup();
    let graph = graphs.resolve(WorkflowType::Chat).unwrap();
    let state = state_for(WorkflowType::Chat, "hello", 10);
    let session_id = state.session_id.clone();

    let cancel = CancelHandle::new();
    cancel.cancel();
    engine
        .run_with_control(&graph, state, cancel)
        .await
        .unwrap();

    let checkpoint = store.load(&session_id).await.unwrap();
    let outcome = engine.resume(&graph, checkpoint).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.session_id, session_id);
    assert!(outcome.state.final_response.is_some());
}

#[tokio::test]
async fn resume_then_immediate_suspend_is_idempotent() {
    let (engine, store, graphs) = builtin_setup();
    let graph = graphs.resolve(WorkflowType::Chat).unwrap();
    let state = state_for(WorkflowType::Chat, "hello", 10);
    let session_id = state.session_id.clone();

    let cancel = CancelHandle::new();
    cancel.cancel();
    engine
        .run_with_control(&graph, state, cancel)
        .await
        .unwrap();
    let first = store.load(&session_id).await.unwrap();

    // Resume but cancel again before any stage runs
    let cancel = CancelHandle::new();
    cancel.cancel();
    let outcome = engine
        .resume_with_control(&graph, first.clone(), cancel)
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Suspended);

    let second = store.load(&session_id).await.unwrap();
    assert_eq!(second.stage_name, first.stage_name);
    assert_eq!(second.state, first.state);
}

#[tokio::test]
async fn resume_rejects_foreign_checkpoint_stage() {
    let (engine, store, graphs) = builtin_setup();
    let chat = graphs.resolve(WorkflowType::Chat).unwrap();
    let device = graphs.resolve(WorkflowType::Device).unwrap();

    let state = state_for(WorkflowType::Chat, "hello", 10);
    let session_id = state.session_id.clone();
    let cancel = CancelHandle::new();
    cancel.cancel();
    engine
        .run_with_control(&chat, state, cancel)
        .await
        .unwrap();

    let checkpoint = store.load(&session_id).await.unwrap();
    let err = engine.resume(&device, checkpoint).await.unwrap_err();
    assert!(matches!(err, WorkflowError::TypeMismatch { .. }));
}

// --- Preconditions and progress ---

#[tokio::test]
async fn run_rejects_mismatched_state_type() {
    let (engine, _store, graphs) = builtin_setup();
    let graph = graphs.resolve(WorkflowType::Chat).unwrap();
    let state = state_for(WorkflowType::Device, "device 7", 10);

    let err = engine.run(&graph, state).await.unwrap_err();
    assert!(matches!(err, WorkflowError::TypeMismatch { .. }));
}

#[tokio::test]
async fn progress_channel_sees_each_stage() {
    let stages = Arc::new(StageRegistry::with_builtins());
    let graphs = GraphRegistry::with_builtins(&stages).unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = WorkflowEngine::new(stages, store)
        .with_config(quick_config())
        .with_progress(tx);

    let graph = graphs.resolve(WorkflowType::Chat).unwrap();
    let outcome = engine
        .run(&graph, state_for(WorkflowType::Chat, "hello", 10))
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    drop(engine);

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }

    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].stage, "chat_intent");
    assert_eq!(updates[0].iteration, 1);
    assert_eq!(updates[1].stage, "chat_response");
    assert_eq!(updates[1].iteration, 2);
}
