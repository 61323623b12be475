use crate::engine::types::{Context, WorkflowType};
use crate::stages::builtin::router::select_domains;

/// Pluggable request classification. The engine never sees this interface;
/// swapping the heuristic for a model-backed classifier touches nothing
/// else.
pub trait RequestClassifier: Send + Sync {
    fn classify(&self, text: &str, context: &Context) -> WorkflowType;
}

/// Lightweight keyword classifier over the same domain table the hybrid
/// router uses. A request touching several domains is classified as hybrid
/// — the most general type wins ties.
pub struct KeywordClassifier;

impl RequestClassifier for KeywordClassifier {
    fn classify(&self, text: &str, context: &Context) -> WorkflowType {
        let domains = select_domains(text, context);
        match domains.as_slice() {
            [] => WorkflowType::Chat,
            [single] => *single,
            _ => WorkflowType::Hybrid,
        }
    }
}
