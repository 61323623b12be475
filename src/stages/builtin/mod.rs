pub mod analytics;
pub mod automation;
pub mod chat;
pub mod device;
pub mod error_report;
pub mod operations;
pub mod router;
pub mod synthesizer;

use std::sync::Arc;

use crate::stages::StageRegistry;

/// Register all built-in stage handlers into the registry.
pub fn register_all(registry: &mut StageRegistry) {
    registry.register(Arc::new(chat::ChatIntentStage));
    registry.register(Arc::new(chat::ChatResponseStage));
    registry.register(Arc::new(analytics::AnalyticsCollectStage));
    registry.register(Arc::new(analytics::AnalyticsReportStage));
    registry.register(Arc::new(device::DeviceDiscoveryStage));
    registry.register(Arc::new(device::DeviceStatusStage));
    registry.register(Arc::new(operations::OperationsTriageStage));
    registry.register(Arc::new(operations::OperationsDispatchStage));
    registry.register(Arc::new(automation::AutomationPlanStage));
    registry.register(Arc::new(automation::AutomationExecuteStage));
    registry.register(Arc::new(router::RouterStage));
    registry.register(Arc::new(synthesizer::SynthesizerStage));
    registry.register(Arc::new(error_report::ErrorReportStage));
}
