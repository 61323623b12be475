pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::{StageOutput, WorkflowState};

/// Trait that all stage handlers must implement — the pluggable unit of work
/// behind every stage name. Handlers see the run state read-only; everything
/// they produce comes back through the returned [`StageOutput`].
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name this handler backs (e.g., "device_discovery").
    fn stage_name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Process the current run state and produce this stage's output.
    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput>;
}

/// Closed registry of stage handlers, one per stage name. Graphs are
/// validated against it at registration time, so unknown stage names are
/// rejected before any run starts.
pub struct StageRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Create a registry with all built-in stage handlers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register a stage handler.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers
            .insert(handler.stage_name().to_string(), handler);
    }

    /// Look up a handler by stage name.
    pub fn get(&self, stage_name: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage_name).cloned()
    }

    /// List all registered stage names with descriptions.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .handlers
            .values()
            .map(|h| (h.stage_name(), h.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
