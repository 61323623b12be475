use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::engine::error::WorkflowError;
use crate::engine::types::{WorkflowState, WorkflowType};
use crate::stages::StageRegistry;

/// Routing decision produced after a stage completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Advance to the named stage.
    Next(String),
    /// Run the named stages concurrently, then continue at `then`.
    FanOut { stages: Vec<String>, then: String },
    /// The run is complete.
    End,
}

/// Routing function evaluated over the accumulated run state. Only dynamic
/// routes may form cycles — they are bounded by the iteration ceiling.
pub type RouteFn = dyn Fn(&WorkflowState) -> Route + Send + Sync;

/// Edge rule attached to a stage.
pub enum Edge {
    /// Fixed successor.
    Next(String),
    /// Successor chosen at run time from the current state.
    Route(Arc<RouteFn>),
    /// Terminal marker.
    End,
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Next(s) => f.debug_tuple("Next").field(s).finish(),
            Edge::Route(_) => f.debug_tuple("Route").field(&"<fn>").finish(),
            Edge::End => f.write_str("End"),
        }
    }
}

/// Immutable definition of a named workflow: its stages and edge rules.
/// Built once at startup, validated against the stage registry, and shared
/// read-only across concurrent runs.
#[derive(Debug)]
pub struct WorkflowGraph {
    workflow_type: WorkflowType,
    start: String,
    stages: Vec<String>,
    edges: HashMap<String, Edge>,
    on_error: Option<String>,
}

impl WorkflowGraph {
    pub fn builder(workflow_type: WorkflowType) -> GraphBuilder {
        GraphBuilder {
            workflow_type,
            stages: Vec::new(),
            edges: HashMap::new(),
            on_error: None,
        }
    }

    /// Two-stage linear graph with the shared error-terminal stage; the
    /// shape of five of the six built-in workflows.
    fn linear(
        workflow_type: WorkflowType,
        first: &str,
        second: &str,
        registry: &StageRegistry,
    ) -> Result<Self, WorkflowError> {
        Self::builder(workflow_type)
            .stage(first)
            .stage(second)
            .next(first, second)
            .end(second)
            .stage("error_report")
            .end("error_report")
            .on_error("error_report")
            .build(registry)
    }

    pub fn workflow_type(&self) -> WorkflowType {
        self.workflow_type
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s == stage)
    }

    pub fn on_error(&self) -> Option<&str> {
        self.on_error.as_deref()
    }

    /// Resolve the route out of `stage` for the given state. Stages without
    /// an edge rule terminate the run; validation makes that unreachable for
    /// registered graphs.
    pub fn resolve_next(&self, stage: &str, state: &WorkflowState) -> Route {
        match self.edges.get(stage) {
            Some(Edge::Next(next)) => Route::Next(next.clone()),
            Some(Edge::Route(f)) => f(state),
            Some(Edge::End) | None => Route::End,
        }
    }
}

/// Builder for [`WorkflowGraph`]. The first stage added becomes the start
/// stage; `build` runs the full validation pass.
pub struct GraphBuilder {
    workflow_type: WorkflowType,
    stages: Vec<String>,
    edges: HashMap<String, Edge>,
    on_error: Option<String>,
}

impl GraphBuilder {
    pub fn stage(mut self, name: &str) -> Self {
        self.stages.push(name.to_string());
        self
    }

    pub fn next(mut self, from: &str, to: &str) -> Self {
        self.edges
            .insert(from.to_string(), Edge::Next(to.to_string()));
        self
    }

    pub fn route<F>(mut self, from: &str, f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Route + Send + Sync + 'static,
    {
        self.edges.insert(from.to_string(), Edge::Route(Arc::new(f)));
        self
    }

    pub fn end(mut self, from: &str) -> Self {
        self.edges.insert(from.to_string(), Edge::End);
        self
    }

    pub fn on_error(mut self, stage: &str) -> Self {
        self.on_error = Some(stage.to_string());
        self
    }

    /// Validate and freeze the graph. Rejects duplicate stage names, edges
    /// to unknown stages, stages without a registered handler, graphs with
    /// no terminal, and cycles through fixed edges.
    pub fn build(self, registry: &StageRegistry) -> Result<WorkflowGraph, WorkflowError> {
        let graph_name = self.workflow_type.to_string();

        let start = match self.stages.first() {
            Some(s) => s.clone(),
            None => {
                return Err(WorkflowError::GraphValidation {
                    graph: graph_name,
                    reason: "graph has no stages".to_string(),
                });
            }
        };

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.clone()) {
                return Err(WorkflowError::GraphValidation {
                    graph: graph_name,
                    reason: format!("duplicate stage name '{}'", stage),
                });
            }
        }

        // Every stage needs an edge rule and a registered handler
        for stage in &self.stages {
            if !self.edges.contains_key(stage) {
                return Err(WorkflowError::GraphValidation {
                    graph: graph_name,
                    reason: format!("stage '{}' has no edge rule", stage),
                });
            }
            if registry.get(stage).is_none() {
                return Err(WorkflowError::UnknownStage {
                    graph: graph_name,
                    stage: stage.clone(),
                });
            }
        }

        // Fixed edges and the error stage must reference known stages
        for (from, edge) in &self.edges {
            if !seen.contains(from) {
                return Err(WorkflowError::UnknownStage {
                    graph: graph_name,
                    stage: from.clone(),
                });
            }
            if let Edge::Next(to) = edge
                && !seen.contains(to)
            {
                return Err(WorkflowError::UnknownStage {
                    graph: graph_name,
                    stage: to.clone(),
                });
            }
        }
        if let Some(err_stage) = &self.on_error
            && !seen.contains(err_stage)
        {
            return Err(WorkflowError::UnknownStage {
                graph: graph_name,
                stage: err_stage.clone(),
            });
        }

        // At least one terminal: an End edge, or a dynamic route that can end
        let has_terminal = self
            .edges
            .values()
            .any(|e| matches!(e, Edge::End | Edge::Route(_)));
        if !has_terminal {
            return Err(WorkflowError::GraphValidation {
                graph: graph_name,
                reason: "graph has no terminal stage".to_string(),
            });
        }

        // Fixed edges must be acyclic; only iteration-bounded dynamic routes
        // may loop. Walk Next-chains from every stage.
        for stage in &self.stages {
            let mut visited = HashSet::new();
            let mut current = stage.as_str();
            while let Some(Edge::Next(to)) = self.edges.get(current) {
                if !visited.insert(current.to_string()) {
                    return Err(WorkflowError::GraphValidation {
                        graph: graph_name,
                        reason: format!("cycle through fixed edges at stage '{}'", current),
                    });
                }
                current = to;
            }
        }

        Ok(WorkflowGraph {
            workflow_type: self.workflow_type,
            start,
            stages: self.stages,
            edges: self.edges,
            on_error: self.on_error,
        })
    }
}

/// The domain stage each workflow type contributes to hybrid fan-out.
pub fn domain_stage(workflow_type: WorkflowType) -> Option<&'static str> {
    match workflow_type {
        WorkflowType::Chat => Some("chat_response"),
        WorkflowType::Analytics => Some("analytics_report"),
        WorkflowType::Device => Some("device_status_check"),
        WorkflowType::Operations => Some("operations_dispatch"),
        WorkflowType::Automation => Some("automation_execute"),
        WorkflowType::Hybrid => None,
    }
}

/// Process-wide set of workflow graphs, initialized once at startup and
/// never mutated afterwards.
pub struct GraphRegistry {
    graphs: HashMap<WorkflowType, Arc<WorkflowGraph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self {
            graphs: HashMap::new(),
        }
    }

    /// Build and validate the six built-in graphs.
    pub fn with_builtins(registry: &StageRegistry) -> Result<Self, WorkflowError> {
        let mut graphs = Self::new();

        graphs.register(WorkflowGraph::linear(
            WorkflowType::Chat,
            "chat_intent",
            "chat_response",
            registry,
        )?);
        graphs.register(WorkflowGraph::linear(
            WorkflowType::Analytics,
            "analytics_collect",
            "analytics_report",
            registry,
        )?);
        graphs.register(WorkflowGraph::linear(
            WorkflowType::Device,
            "device_discovery",
            "device_status_check",
            registry,
        )?);
        graphs.register(WorkflowGraph::linear(
            WorkflowType::Operations,
            "operations_triage",
            "operations_dispatch",
            registry,
        )?);
        graphs.register(WorkflowGraph::linear(
            WorkflowType::Automation,
            "automation_plan",
            "automation_execute",
            registry,
        )?);
        graphs.register(hybrid_graph(registry)?);

        Ok(graphs)
    }

    pub fn register(&mut self, graph: WorkflowGraph) {
        self.graphs.insert(graph.workflow_type(), Arc::new(graph));
    }

    pub fn resolve(
        &self,
        workflow_type: WorkflowType,
    ) -> Result<Arc<WorkflowGraph>, WorkflowError> {
        self.graphs
            .get(&workflow_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Registered workflow types, in declaration order.
    pub fn types(&self) -> Vec<WorkflowType> {
        let mut types: Vec<WorkflowType> = self.graphs.keys().copied().collect();
        types.sort();
        types
    }
}

impl Default for GraphRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The branching hybrid graph: router -> selected domain stages -> synthesizer.
fn hybrid_graph(registry: &StageRegistry) -> Result<WorkflowGraph, WorkflowError> {
    let mut builder = WorkflowGraph::builder(WorkflowType::Hybrid)
        .stage("router")
        .route("router", |state: &WorkflowState| {
            let selected: Vec<String> = state
                .stage_results
                .get("router")
                .and_then(|r| r.get("selected"))
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str())
                        .filter_map(|name| name.parse::<WorkflowType>().ok())
                        .filter_map(domain_stage)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();

            // Fail open: an empty selection fans out to every domain rather
            // than leaving the user without an answer
            let stages = if selected.is_empty() {
                all_domain_stages()
            } else {
                selected
            };

            Route::FanOut {
                stages,
                then: "synthesizer".to_string(),
            }
        });

    for stage in all_domain_stages() {
        builder = builder.stage(&stage).next(&stage, "synthesizer");
    }

    builder
        .stage("synthesizer")
        .end("synthesizer")
        .stage("error_report")
        .end("error_report")
        .on_error("error_report")
        .build(registry)
}

fn all_domain_stages() -> Vec<String> {
    WorkflowType::ALL
        .iter()
        .filter_map(|wt| domain_stage(*wt))
        .map(String::from)
        .collect()
}
