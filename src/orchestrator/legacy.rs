use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::{Context, WorkflowType};
use crate::stages::builtin::router::select_domains;

/// The fallback collaborator: a single-pass, non-graph, non-checkpointed
/// execution of the same request.
#[async_trait]
pub trait LegacyOrchestrator: Send + Sync {
    async fn process(&self, request: &str, context: &Context) -> Result<String>;
}

/// Built-in single-pass orchestrator. One classification, one direct reply;
/// no stages, no state, no recovery.
pub struct SinglePassOrchestrator;

#[async_trait]
impl LegacyOrchestrator for SinglePassOrchestrator {
    async fn process(&self, request: &str, context: &Context) -> Result<String> {
        let domains = select_domains(request, context);
        let reply = match domains.as_slice() {
            [] => format!("Understood: \"{}\".", request.trim()),
            [single] => format!(
                "Handled your {} request: \"{}\".",
                domain_label(*single),
                request.trim()
            ),
            many => format!(
                "Handled your request across {} areas: {}.",
                many.len(),
                many.iter()
                    .map(|d| domain_label(*d))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        Ok(reply)
    }
}

fn domain_label(workflow_type: WorkflowType) -> &'static str {
    workflow_type.as_str()
}
