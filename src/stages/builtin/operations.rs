use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Message, StageOutput, WorkflowState};
use crate::stages::StageHandler;

/// Grade the urgency of an operational request.
pub struct OperationsTriageStage;

#[async_trait]
impl StageHandler for OperationsTriageStage {
    fn stage_name(&self) -> &str {
        "operations_triage"
    }

    fn description(&self) -> &str {
        "Grade the urgency of an operational request"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let severity = triage(&state.original_request);

        Ok(StageOutput {
            result: json!({
                "severity": severity,
                "summary": format!("Triaged as {} severity", severity),
            }),
            messages: vec![Message::stage(
                "operations_triage",
                format!("Triaged request as {} severity", severity),
            )],
            ..Default::default()
        })
    }
}

/// Dispatch the triaged request to the matching runbook. Terminal stage of
/// the operations graph.
pub struct OperationsDispatchStage;

#[async_trait]
impl StageHandler for OperationsDispatchStage {
    fn stage_name(&self) -> &str {
        "operations_dispatch"
    }

    fn description(&self) -> &str {
        "Dispatch a triaged request to the matching runbook"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let severity = state
            .stage_results
            .get("operations_triage")
            .and_then(|r| r.get("severity"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| triage(&state.original_request).to_string());

        let response = match severity.as_str() {
            "critical" => "Paging the on-call engineer and opening an incident channel.",
            "high" => "Filed a high-priority ticket; the operations queue has been notified.",
            _ => "Logged the request in the routine maintenance queue.",
        }
        .to_string();

        Ok(StageOutput {
            result: json!({
                "severity": severity,
                "summary": response.clone(),
            }),
            messages: vec![Message::stage("operations_dispatch", response.clone())],
            final_response: Some(response),
            ..Default::default()
        })
    }
}

fn triage(request: &str) -> &'static str {
    let lower = request.to_lowercase();
    if ["critical", "outage", "down", "data loss"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "critical"
    } else if ["urgent", "failing", "degraded", "error"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "high"
    } else {
        "routine"
    }
}
