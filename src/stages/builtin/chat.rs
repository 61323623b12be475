use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Message, StageOutput, WorkflowState};
use crate::stages::StageHandler;

/// Classify the conversational intent of the request.
pub struct ChatIntentStage;

#[async_trait]
impl StageHandler for ChatIntentStage {
    fn stage_name(&self) -> &str {
        "chat_intent"
    }

    fn description(&self) -> &str {
        "Classify the conversational intent of a chat request"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let text = state.original_request.trim();
        let lower = text.to_lowercase();

        let intent = if ["hello", "hi ", "hey", "good morning", "good evening"]
            .iter()
            .any(|g| lower.starts_with(g))
        {
            "greeting"
        } else if text.ends_with('?')
            || ["what", "how", "why", "when", "where", "who", "can you", "could you"]
                .iter()
                .any(|q| lower.starts_with(q))
        {
            "question"
        } else if ["please", "do ", "run ", "start ", "stop ", "set "]
            .iter()
            .any(|c| lower.starts_with(c))
        {
            "command"
        } else {
            "statement"
        };

        Ok(StageOutput {
            result: json!({
                "intent": intent,
                "word_count": text.split_whitespace().count(),
                "summary": format!("Intent classified as '{}'", intent),
            }),
            messages: vec![Message::stage(
                "chat_intent",
                format!("Classified request as a {}", intent),
            )],
            ..Default::default()
        })
    }
}

/// Produce the conversational reply. Terminal stage of the chat graph; also
/// runs standalone inside hybrid fan-out, where the intent stage may not
/// have executed.
pub struct ChatResponseStage;

#[async_trait]
impl StageHandler for ChatResponseStage {
    fn stage_name(&self) -> &str {
        "chat_response"
    }

    fn description(&self) -> &str {
        "Generate the conversational reply to a chat request"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let intent = state
            .stage_results
            .get("chat_intent")
            .and_then(|r| r.get("intent"))
            .and_then(|v| v.as_str())
            .unwrap_or("statement");

        let reply = match intent {
            "greeting" => "Hello! How can I help you today?".to_string(),
            "question" => format!(
                "Here's what I found regarding \"{}\".",
                state.original_request.trim()
            ),
            "command" => format!("On it — handling \"{}\".", state.original_request.trim()),
            _ => format!("Understood: \"{}\".", state.original_request.trim()),
        };

        Ok(StageOutput {
            result: json!({
                "intent": intent,
                "summary": reply.clone(),
            }),
            messages: vec![Message::stage("chat_response", reply.clone())],
            final_response: Some(reply),
            ..Default::default()
        })
    }
}
