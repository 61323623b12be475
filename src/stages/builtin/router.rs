use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Context, Message, StageOutput, WorkflowState, WorkflowType};
use crate::stages::StageHandler;

/// Keyword table driving both hybrid fan-out selection and request
/// classification. Chat carries no keywords — it is the fallback domain.
const DOMAIN_KEYWORDS: &[(WorkflowType, &[&str])] = &[
    (
        WorkflowType::Analytics,
        &[
            "report", "metric", "analytics", "trend", "usage", "statistic", "chart", "dashboard",
            "summary of",
        ],
    ),
    (
        WorkflowType::Device,
        &[
            "device", "sensor", "thermostat", "camera", "firmware", "battery", "bulb", "lock",
        ],
    ),
    (
        WorkflowType::Operations,
        &[
            "incident", "alert", "outage", "maintenance", "deploy", "operations", "on-call",
            "escalate",
        ],
    ),
    (
        WorkflowType::Automation,
        &[
            "automate", "automation", "schedule", "routine", "scene", "trigger", "rule",
        ],
    ),
];

/// Pick the domain workflow types a request touches, by keyword match over
/// the request text plus an optional `domains` list in the context.
pub fn select_domains(text: &str, context: &Context) -> Vec<WorkflowType> {
    let lower = text.to_lowercase();
    let mut selected = Vec::new();

    for (workflow_type, keywords) in DOMAIN_KEYWORDS {
        if keywords.iter().any(|k| lower.contains(k)) {
            selected.push(*workflow_type);
        }
    }

    // Explicit domain hints in the context are unioned in
    if let Some(hints) = context.get("domains").and_then(|v| v.as_array()) {
        for hint in hints {
            if let Some(s) = hint.as_str()
                && let Ok(wt) = s.parse::<WorkflowType>()
                && wt != WorkflowType::Hybrid
                && !selected.contains(&wt)
            {
                selected.push(wt);
            }
        }
    }

    selected
}

/// First stage of the hybrid graph. Records which domains the request
/// touches; the graph's routing rule turns that into the fan-out set. An
/// empty selection is recorded as-is and fails open at the routing rule.
pub struct RouterStage;

#[async_trait]
impl StageHandler for RouterStage {
    fn stage_name(&self) -> &str {
        "router"
    }

    fn description(&self) -> &str {
        "Select the domain stages a hybrid request fans out to"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let selected = select_domains(&state.original_request, &state.context);
        let names: Vec<&str> = selected.iter().map(|t| t.as_str()).collect();
        let fail_open = names.is_empty();

        let note = if fail_open {
            "No domain matched — fanning out to all domains".to_string()
        } else {
            format!("Routing to {} domain(s): {}", names.len(), names.join(", "))
        };

        Ok(StageOutput {
            result: json!({
                "selected": names,
                "fail_open": fail_open,
                "summary": note,
            }),
            messages: vec![Message::stage("router", note)],
            ..Default::default()
        })
    }
}
