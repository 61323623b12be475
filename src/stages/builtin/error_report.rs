use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Message, Role, StageOutput, WorkflowState};
use crate::stages::StageHandler;

/// Error-terminal stage. Runs once after a stage exhausts its retries,
/// recording what failed so the degraded response can carry it. Never sets
/// the final response — a failed run is answered by the fallback tier.
pub struct ErrorReportStage;

#[async_trait]
impl StageHandler for ErrorReportStage {
    fn stage_name(&self) -> &str {
        "error_report"
    }

    fn description(&self) -> &str {
        "Record stage-failure details for the degraded response"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let detail = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "unknown stage failure".to_string());

        Ok(StageOutput {
            result: json!({
                "failed": true,
                "error_count": state.error_count,
                "detail": detail,
                "completed_stages": state.stage_results.len(),
                "summary": format!("Run failed after {} error(s)", state.error_count),
            }),
            messages: vec![Message::stage(
                "error_report",
                format!("Recorded failure report ({} error(s))", state.error_count),
            )],
            ..Default::default()
        })
    }
}
