use async_trait::async_trait;
use proctor_core::errors::EngineError;
use proctor_core::model::{CriteriaKind, ScoringCriteria};
use proctor_core::scoring_api::{ScoreOutcome, ScoringStrategy};
use serde_json::Value;

use crate::stringify;

const DEFAULT_THRESHOLD: f64 = 0.8;

/// Normalized Levenshtein similarity between the text forms of expected
/// and actual output. Two empty strings count as identical.
pub struct SimilarityStrategy;

#[async_trait]
impl ScoringStrategy for SimilarityStrategy {
    fn kind(&self) -> CriteriaKind {
        CriteriaKind::Similarity
    }

    async fn score(
        &self,
        _tenant: &str,
        _input: &Value,
        expected: &Value,
        actual: &Value,
        criteria: Option<&ScoringCriteria>,
    ) -> Result<ScoreOutcome, EngineError> {
        let threshold = match criteria {
            Some(ScoringCriteria::Similarity { threshold }) => {
                threshold.unwrap_or(DEFAULT_THRESHOLD)
            }
            _ => DEFAULT_THRESHOLD,
        };
        let score = strsim::normalized_levenshtein(&stringify(expected), &stringify(actual));
        Ok(ScoreOutcome {
            passed: score >= threshold,
            score,
        })
    }
}
