//! Tests for workflow graph definitions, validation, and the registry.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use stageflow::engine::error::WorkflowError;
use stageflow::engine::graph::{GraphRegistry, Route, WorkflowGraph, domain_stage};
use stageflow::engine::types::*;
use stageflow::stages::{StageHandler, StageRegistry};

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

fn registry_with(names: &[&'static str]) -> StageRegistry {
    let mut registry = StageRegistry::new();
    for name in names {
        registry.register(Arc::new(EchoStage(name)));
    }
    registry
}

fn builtin_graphs() -> GraphRegistry {
    GraphRegistry::with_builtins(&StageRegistry::with_builtins()).unwrap()
}

// --- Registry ---

#[test]
fn builtins_register_all_six_types() {
    let graphs = builtin_graphs();
    for wt in WorkflowType::ALL {
        assert!(graphs.resolve(wt).is_ok(), "missing graph for {}", wt);
    }
    assert_eq!(graphs.types().len(), 6);
}

#[test]
fn empty_registry_reports_unknown_type() {
    let graphs = GraphRegistry::new();
    let err = graphs.resolve(WorkflowType::Chat).unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownWorkflowType(_)));
}

#[test]
fn builtin_stage_names_are_unique() {
    let graphs = builtin_graphs();
    for wt in WorkflowType::ALL {
        let graph = graphs.resolve(wt).unwrap();
        let unique: HashSet<&String> = graph.stages().iter().collect();
        assert_eq!(unique.len(), graph.stages().len(), "duplicates in {}", wt);
        assert!(graph.contains(graph.start()));
    }
}

#[test]
fn device_graph_shape() {
    let graphs = builtin_graphs();
    let graph = graphs.resolve(WorkflowType::Device).unwrap();
    assert_eq!(graph.start(), "device_discovery");
    assert!(graph.contains("device_status_check"));

    let state = WorkflowState::new(WorkflowType::Device, "device 7", Context::new(), 10);
    assert_eq!(
        graph.resolve_next("device_discovery", &state),
        Route::Next("device_status_check".to_string())
    );
    assert_eq!(graph.resolve_next("device_status_check", &state), Route::End);
}

// --- Validation ---

#[test]
fn duplicate_stage_rejected() {
    let registry = registry_with(&["a"]);
    let err = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("a")
        .stage("a")
        .end("a")
        .build(&registry)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::GraphValidation { .. }));
}

#[test]
fn missing_edge_rule_rejected() {
    let registry = registry_with(&["a"]);
    let err = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("a")
        .build(&registry)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::GraphValidation { .. }));
}

#[test]
fn edge_to_unknown_stage_rejected() {
    let registry = registry_with(&["a"]);
    let err = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("a")
        .next("a", "ghost")
        .build(&registry)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownStage { .. }));
}

#[test]
fn unregistered_handler_rejected() {
    let registry = registry_with(&["a"]);
    let err = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("a")
        .stage("b")
        .next("a", "b")
        .end("b")
        .build(&registry)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownStage { .. }));
}

#[test]
fn fixed_edge_cycle_rejected() {
    let registry = registry_with(&["a", "b"]);
    let err = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("a")
        .stage("b")
        .next("a", "b")
        .next("b", "a")
        .build(&registry)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::GraphValidation { .. }));
}

#[test]
fn empty_graph_rejected() {
    let registry = registry_with(&[]);
    let err = WorkflowGraph::builder(WorkflowType::Chat)
        .build(&registry)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::GraphValidation { .. }));
}

#[test]
fn dynamic_route_cycle_is_allowed() {
    // Cycles through routing functions are legal — they are bounded by the
    // iteration ceiling at run time
    let registry = registry_with(&["a"]);
    let graph = WorkflowGraph::builder(WorkflowType::Chat)
        .stage("a")
        .route("a", |_| Route::Next("a".to_string()))
        .build(&registry);
    assert!(graph.is_ok());
}

// --- Hybrid routing ---

#[test]
fn hybrid_router_selects_matched_domains() {
    let graphs = builtin_graphs();
    let graph = graphs.resolve(WorkflowType::Hybrid).unwrap();

    let mut state = WorkflowState::new(
        WorkflowType::Hybrid,
        "usage report for device 7",
        Context::new(),
        10,
    );
    state.stage_results.insert(
        "router".to_string(),
        serde_json::json!({"selected": ["analytics", "device"]}),
    );

    match graph.resolve_next("router", &state) {
        Route::FanOut { stages, then } => {
            assert_eq!(
                stages,
                vec!["analytics_report".to_string(), "device_status_check".to_string()]
            );
            assert_eq!(then, "synthesizer");
        }
        other => panic!("expected fan-out, got {:?}", other),
    }
}

#[test]
fn hybrid_router_fails_open_on_empty_selection() {
    let graphs = builtin_graphs();
    let graph = graphs.resolve(WorkflowType::Hybrid).unwrap();

    let mut state =
        WorkflowState::new(WorkflowType::Hybrid, "do something", Context::new(), 10);
    state
        .stage_results
        .insert("router".to_string(), serde_json::json!({"selected": []}));

    match graph.resolve_next("router", &state) {
        Route::FanOut { stages, .. } => {
            // Every domain stage, not none
            assert_eq!(stages.len(), 5);
            for wt in WorkflowType::ALL {
                if let Some(stage) = domain_stage(wt) {
                    assert!(stages.contains(&stage.to_string()));
                }
            }
        }
        other => panic!("expected fan-out, got {:?}", other),
    }
}

#[test]
fn domain_stage_mapping() {
    assert_eq!(domain_stage(WorkflowType::Chat), Some("chat_response"));
    assert_eq!(domain_stage(WorkflowType::Device), Some("device_status_check"));
    assert_eq!(domain_stage(WorkflowType::Hybrid), None);
}
