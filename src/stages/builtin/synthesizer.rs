use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Message, StageOutput, WorkflowState};
use crate::stages::StageHandler;

/// Join stage of the hybrid graph: folds the fanned-out domain results into
/// one combined answer. Results are merged in stage-name order so repeated
/// runs synthesize identically regardless of completion order.
pub struct SynthesizerStage;

#[async_trait]
impl StageHandler for SynthesizerStage {
    fn stage_name(&self) -> &str {
        "synthesizer"
    }

    fn description(&self) -> &str {
        "Combine fanned-out domain results into one answer"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let mut entries: Vec<(&String, &serde_json::Value)> = state
            .stage_results
            .iter()
            .filter(|(name, _)| name.as_str() != "router" && name.as_str() != "error_report")
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        if entries.is_empty() {
            bail!("no domain results to synthesize");
        }

        let parts: Vec<String> = entries
            .iter()
            .map(|(name, result)| {
                let summary = result
                    .get("summary")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| result.to_string());
                format!("[{}] {}", name, summary)
            })
            .collect();

        let response = parts.join(" ");

        Ok(StageOutput {
            result: json!({
                "sources": entries.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
                "summary": response.clone(),
            }),
            messages: vec![Message::stage("synthesizer", response.clone())],
            final_response: Some(response),
            ..Default::default()
        })
    }
}
