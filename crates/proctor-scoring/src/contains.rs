use async_trait::async_trait;
use proctor_core::errors::EngineError;
use proctor_core::model::{CriteriaKind, ScoringCriteria};
use proctor_core::scoring_api::{ScoreOutcome, ScoringStrategy};
use serde_json::Value;

use crate::stringify;

/// Substring check on the text forms of expected and actual output.
pub struct ContainsStrategy;

#[async_trait]
impl ScoringStrategy for ContainsStrategy {
    fn kind(&self) -> CriteriaKind {
        CriteriaKind::Contains
    }

    async fn score(
        &self,
        _tenant: &str,
        _input: &Value,
        expected: &Value,
        actual: &Value,
        _criteria: Option<&ScoringCriteria>,
    ) -> Result<ScoreOutcome, EngineError> {
        let needle = stringify(expected);
        let haystack = stringify(actual);
        Ok(if haystack.contains(&needle) {
            ScoreOutcome::pass(1.0)
        } else {
            ScoreOutcome::fail(0.0)
        })
    }
}
