use std::sync::Arc;

use async_trait::async_trait;
use proctor_core::errors::EngineError;
use proctor_core::model::{CriteriaKind, ScoringCriteria};
use proctor_core::sandbox::{Sandbox, SandboxLimits};
use proctor_core::scoring_api::{ScoreOutcome, ScoringStrategy};
use proctor_core::storage::Store;
use serde_json::{json, Value};

const DEFAULT_THRESHOLD: f64 = 0.5;

/// Scores with a tenant-registered function, executed in the sandbox.
///
/// The function sees one JSON object: `input`, `expected_output`,
/// `actual_output`. Whatever score it prints is compared against the
/// case's threshold.
pub struct CustomStrategy {
    store: Store,
    sandbox: Arc<dyn Sandbox>,
    limits: SandboxLimits,
}

pub fn strategy(
    store: Store,
    sandbox: Arc<dyn Sandbox>,
    limits: SandboxLimits,
) -> Arc<dyn ScoringStrategy> {
    Arc::new(CustomStrategy {
        store,
        sandbox,
        limits,
    })
}

#[async_trait]
impl ScoringStrategy for CustomStrategy {
    fn kind(&self) -> CriteriaKind {
        CriteriaKind::Custom
    }

    async fn score(
        &self,
        tenant: &str,
        input: &Value,
        expected: &Value,
        actual: &Value,
        criteria: Option<&ScoringCriteria>,
    ) -> Result<ScoreOutcome, EngineError> {
        let Some(ScoringCriteria::Custom {
            function,
            threshold,
        }) = criteria
        else {
            return Err(EngineError::Validation(
                "custom scoring requires a function name".into(),
            ));
        };

        let func = self
            .store
            .function_by_name(tenant, function)?
            .ok_or_else(|| EngineError::not_found("scoring function", function))?;
        if !func.is_active {
            return Err(EngineError::Validation(format!(
                "scoring function '{function}' is deactivated"
            )));
        }

        let args = json!({
            "input": input,
            "expected_output": expected,
            "actual_output": actual,
        });
        let run = self.sandbox.run(&func.code, &args, &self.limits).await;
        let score = run.into_score()?;

        let threshold = threshold.unwrap_or(DEFAULT_THRESHOLD);
        Ok(ScoreOutcome {
            passed: score >= threshold,
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_core::errors::SandboxError;
    use proctor_core::model::FunctionMetadata;
    use proctor_core::sandbox::SandboxRun;

    /// Returns a fixed score, or an error when the code asks for one.
    struct FakeSandbox {
        score: f64,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn compile(&self, _code: &str) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn run(&self, code: &str, _args: &Value, _limits: &SandboxLimits) -> SandboxRun {
            if code.contains("crash") {
                return SandboxRun {
                    score: None,
                    error: Some(SandboxError::Crashed("exit 1".into())),
                    elapsed_ms: 1,
                };
            }
            SandboxRun {
                score: Some(self.score),
                error: None,
                elapsed_ms: 1,
            }
        }
    }

    fn with_function(code: &str, score: f64) -> CustomStrategy {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        store
            .insert_function("acme", "grade", code, "digest", &FunctionMetadata::default())
            .unwrap();
        CustomStrategy {
            store,
            sandbox: Arc::new(FakeSandbox { score }),
            limits: SandboxLimits::default(),
        }
    }

    fn custom(threshold: Option<f64>) -> ScoringCriteria {
        ScoringCriteria::Custom {
            function: "grade".into(),
            threshold,
        }
    }

    #[tokio::test]
    async fn passes_at_default_threshold() {
        let s = with_function("echo 0.6", 0.6);
        let outcome = s
            .score("acme", &json!("in"), &json!("exp"), &json!("act"), Some(&custom(None)))
            .await
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.score, 0.6);
    }

    #[tokio::test]
    async fn fails_below_explicit_threshold() {
        let s = with_function("echo 0.6", 0.6);
        let outcome = s
            .score(
                "acme",
                &json!("in"),
                &json!("exp"),
                &json!("act"),
                Some(&custom(Some(0.9))),
            )
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.score, 0.6);
    }

    #[tokio::test]
    async fn unknown_function_is_not_found() {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        let s = CustomStrategy {
            store,
            sandbox: Arc::new(FakeSandbox { score: 1.0 }),
            limits: SandboxLimits::default(),
        };
        let err = s
            .score("acme", &json!(null), &json!(null), &json!(null), Some(&custom(None)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn deactivated_function_is_rejected() {
        let s = with_function("echo 1", 1.0);
        s.store.set_function_active("acme", "grade", false).unwrap();

        let err = s
            .score("acme", &json!(null), &json!(null), &json!(null), Some(&custom(None)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deactivated"));
    }

    #[tokio::test]
    async fn sandbox_failure_propagates_as_error() {
        let s = with_function("crash now", 0.0);
        let err = s
            .score("acme", &json!(null), &json!(null), &json!(null), Some(&custom(None)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Sandbox(_)));
    }

    #[tokio::test]
    async fn missing_criteria_is_a_validation_error() {
        let s = with_function("echo 1", 1.0);
        let err = s
            .score("acme", &json!(null), &json!(null), &json!(null), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("function name"));
    }

    #[tokio::test]
    async fn tenants_cannot_reach_each_others_functions() {
        let s = with_function("echo 1", 1.0);
        let err = s
            .score("rival", &json!(null), &json!(null), &json!(null), Some(&custom(None)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
