use async_trait::async_trait;
use proctor_core::errors::EngineError;
use proctor_core::model::{CriteriaKind, ScoringCriteria};
use proctor_core::scoring_api::{ScoreOutcome, ScoringStrategy};
use serde_json::Value;

/// Deep JSON equality. Also the default when a test case names no criteria.
pub struct ExactMatchStrategy;

#[async_trait]
impl ScoringStrategy for ExactMatchStrategy {
    fn kind(&self) -> CriteriaKind {
        CriteriaKind::ExactMatch
    }

    async fn score(
        &self,
        _tenant: &str,
        _input: &Value,
        expected: &Value,
        actual: &Value,
        _criteria: Option<&ScoringCriteria>,
    ) -> Result<ScoreOutcome, EngineError> {
        Ok(if expected == actual {
            ScoreOutcome::pass(1.0)
        } else {
            ScoreOutcome::fail(0.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn equal_values_pass() {
        let outcome = ExactMatchStrategy
            .score("t", &json!(null), &json!({"a": [1, 2]}), &json!({"a": [1, 2]}), None)
            .await
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.score, 1.0);
    }

    #[tokio::test]
    async fn different_values_fail_with_zero() {
        let outcome = ExactMatchStrategy
            .score("t", &json!(null), &json!("yes"), &json!("no"), None)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.score, 0.0);
    }

    #[tokio::test]
    async fn type_mismatch_fails() {
        // "1" (string) is not 1 (number).
        let outcome = ExactMatchStrategy
            .score("t", &json!(null), &json!(1), &json!("1"), None)
            .await
            .unwrap();
        assert!(!outcome.passed);
    }
}
