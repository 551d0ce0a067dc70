use std::sync::Arc;

use proctor_core::sandbox::{Sandbox, SandboxLimits};
use proctor_core::scoring_api::ScoringStrategy;
use proctor_core::storage::Store;

mod contains;
mod custom;
mod exact_match;
mod similarity;

pub use contains::ContainsStrategy;
pub use custom::CustomStrategy;
pub use exact_match::ExactMatchStrategy;
pub use similarity::SimilarityStrategy;

/// The full built-in strategy set. `store` and `sandbox` back the custom
/// strategy's function lookups and executions.
pub fn default_strategies(
    store: Store,
    sandbox: Arc<dyn Sandbox>,
    limits: SandboxLimits,
) -> Vec<Arc<dyn ScoringStrategy>> {
    vec![
        Arc::new(ExactMatchStrategy),
        Arc::new(ContainsStrategy),
        Arc::new(SimilarityStrategy),
        custom::strategy(store, sandbox, limits),
    ]
}

/// Text form used by the string-based strategies: JSON strings unwrap to
/// their contents, everything else keeps its compact JSON encoding.
pub(crate) fn stringify(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
