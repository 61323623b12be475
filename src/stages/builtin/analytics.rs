use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Context, Message, StageOutput, WorkflowState};
use crate::stages::StageHandler;

/// Gather the metric set the report stage works from. Metrics come from the
/// caller's context when supplied, otherwise from the platform defaults.
pub struct AnalyticsCollectStage;

#[async_trait]
impl StageHandler for AnalyticsCollectStage {
    fn stage_name(&self) -> &str {
        "analytics_collect"
    }

    fn description(&self) -> &str {
        "Collect the metrics a report is built from"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let (metrics, source) = collect_metrics(&state.context);
        let count = metrics.as_object().map(|m| m.len()).unwrap_or(0);

        Ok(StageOutput {
            result: json!({
                "metrics": metrics,
                "source": source,
                "summary": format!("Collected {} metric(s) from {}", count, source),
            }),
            messages: vec![Message::stage(
                "analytics_collect",
                format!("Collected {} metric(s)", count),
            )],
            ..Default::default()
        })
    }
}

/// Render the metrics into a report. Terminal stage of the analytics graph;
/// inside hybrid fan-out it collects on its own.
pub struct AnalyticsReportStage;

#[async_trait]
impl StageHandler for AnalyticsReportStage {
    fn stage_name(&self) -> &str {
        "analytics_report"
    }

    fn description(&self) -> &str {
        "Summarize collected metrics into a report"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let metrics = match state
            .stage_results
            .get("analytics_collect")
            .and_then(|r| r.get("metrics"))
        {
            Some(m) => m.clone(),
            None => collect_metrics(&state.context).0,
        };

        let mut lines: Vec<String> = metrics
            .as_object()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect()
            })
            .unwrap_or_default();
        lines.sort();

        let report = if lines.is_empty() {
            "No metrics available for the requested period.".to_string()
        } else {
            format!("Analytics report — {}", lines.join(", "))
        };

        Ok(StageOutput {
            result: json!({
                "report": report,
                "metric_count": lines.len(),
                "summary": report.clone(),
            }),
            messages: vec![Message::stage("analytics_report", report.clone())],
            final_response: Some(report),
            ..Default::default()
        })
    }
}

fn collect_metrics(context: &Context) -> (serde_json::Value, &'static str) {
    match context.get("metrics") {
        Some(m) if m.is_object() => (m.clone(), "context"),
        _ => (
            json!({
                "active_sessions": 42,
                "messages_today": 1280,
                "avg_response_ms": 240,
            }),
            "defaults",
        ),
    }
}
