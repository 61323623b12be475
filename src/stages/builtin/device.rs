use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{Context, Message, StageOutput, WorkflowState};
use crate::stages::StageHandler;

/// Resolve which devices the request refers to. Numeric tokens in the
/// request are treated as device ids; the caller can also pass a `devices`
/// list in the context.
pub struct DeviceDiscoveryStage;

#[async_trait]
impl StageHandler for DeviceDiscoveryStage {
    fn stage_name(&self) -> &str {
        "device_discovery"
    }

    fn description(&self) -> &str {
        "Resolve the devices a request refers to"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let devices = discover_devices(&state.original_request, &state.context);

        Ok(StageOutput {
            result: json!({
                "devices": devices,
                "count": devices.len(),
                "summary": format!("Discovered {} device(s)", devices.len()),
            }),
            messages: vec![Message::stage(
                "device_discovery",
                format!("Discovered {} device(s): {}", devices.len(), devices.join(", ")),
            )],
            ..Default::default()
        })
    }
}

/// Check and report device status. Terminal stage of the device graph; runs
/// its own discovery when fanned out directly.
pub struct DeviceStatusStage;

#[async_trait]
impl StageHandler for DeviceStatusStage {
    fn stage_name(&self) -> &str {
        "device_status_check"
    }

    fn description(&self) -> &str {
        "Report the status of the resolved devices"
    }

    async fn invoke(&self, state: &WorkflowState) -> Result<StageOutput> {
        let devices: Vec<String> = match state
            .stage_results
            .get("device_discovery")
            .and_then(|r| r.get("devices"))
            .and_then(|v| v.as_array())
        {
            Some(list) => list
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            None => discover_devices(&state.original_request, &state.context),
        };

        let statuses: Vec<String> = devices
            .iter()
            .map(|d| format!("device {}: online", d))
            .collect();

        let response = if statuses.is_empty() {
            "No devices matched the request.".to_string()
        } else {
            format!("Device status — {}", statuses.join("; "))
        };

        Ok(StageOutput {
            result: json!({
                "statuses": statuses,
                "summary": response.clone(),
            }),
            messages: vec![Message::stage("device_status_check", response.clone())],
            final_response: Some(response),
            ..Default::default()
        })
    }
}

fn discover_devices(request: &str, context: &Context) -> Vec<String> {
    let mut devices: Vec<String> = request
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|tok| !tok.is_empty() && tok.chars().all(|c| c.is_ascii_digit()))
        .map(String::from)
        .collect();

    if let Some(extra) = context.get("devices").and_then(|v| v.as_array()) {
        for d in extra {
            if let Some(s) = d.as_str()
                && !devices.iter().any(|existing| existing == s)
            {
                devices.push(s.to_string());
            }
        }
    }

    // Fall back to the hub itself so a vague request still gets an answer
    if devices.is_empty() {
        devices.push("hub".to_string());
    }

    devices
}
