use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Message, StageOutput, WorkflowState};
use crate::stages::StageHandler;

/// Derive an automation plan from the request: what triggers it and what it
/// should do.
pub struct AutomationPlanStage;

#[async_trait]
impl StageHandler for AutomationPlanStage {
    fn stage_name(&self) -> &str {
        "automation_plan"
    }

    fn description(&self) -> &str {
        "Derive an automation plan from the request"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let trigger = detect_trigger(&state.original_request);

        Ok(StageOutput {
            result: json!({
                "trigger": trigger,
                "action": state.original_request.trim(),
                "summary": format!("Planned a {} automation", trigger),
            }),
            messages: vec![Message::stage(
                "automation_plan",
                format!("Planned automation with {} trigger", trigger),
            )],
            ..Default::default()
        })
    }
}

/// Install the planned automation. Terminal stage of the automation graph.
/// Keeps a run counter in the mutable slice of the context.
pub struct AutomationExecuteStage;

#[async_trait]
impl StageHandler for AutomationExecuteStage {
    fn stage_name(&self) -> &str {
        "automation_execute"
    }

    fn description(&self) -> &str {
        "Install the planned automation rule"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let trigger = state
            .stage_results
            .get("automation_plan")
            .and_then(|r| r.get("trigger"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| detect_trigger(&state.original_request).to_string());

        let installed = state
            .context
            .get("mutable.automations_installed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;

        let response = format!(
            "Automation rule installed with a {} trigger ({} rule(s) active).",
            trigger, installed
        );

        let mut context_updates = std::collections::HashMap::new();
        context_updates.insert("mutable.automations_installed".to_string(), json!(installed));

        Ok(StageOutput {
            result: json!({
                "trigger": trigger,
                "installed": installed,
                "summary": response.clone(),
            }),
            messages: vec![Message::stage("automation_execute", response.clone())],
            final_response: Some(response),
            context_updates,
        })
    }
}

fn detect_trigger(request: &str) -> &'static str {
    let lower = request.to_lowercase();
    if ["every", "daily", "each morning", "each night", "at "]
        .iter()
        .any(|k| lower.contains(k))
    {
        "scheduled"
    } else if ["when", "if ", "whenever", "on arrival"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "conditional"
    } else {
        "manual"
    }
}
