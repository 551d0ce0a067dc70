use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::errors::EngineError;
use crate::model::{CriteriaKind, TestCase, TestCaseResult};
use crate::providers::{Invocation, VersionClient};
use crate::resilience::{retry, BreakerRegistry, RetryPolicy};
use crate::scoring_api::ScoringStrategy;

/// Registry key of the breaker guarding version invocations.
pub const INVOKER_BREAKER: &str = "invoker";

/// Per-case results in suite order, plus accumulated invocation usage.
#[derive(Debug, Default)]
pub struct SuiteOutcome {
    pub results: Vec<TestCaseResult>,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Executes a suite's test cases against one version, bounded-parallel.
///
/// Invocations go through the retry layer and the invoker breaker. Scoring
/// and invocation errors are confined to their test case: the case comes
/// back failed with the error message, and the suite keeps going.
#[derive(Clone)]
pub struct SuiteRunner {
    pub invoker: Arc<dyn VersionClient>,
    pub strategies: Arc<HashMap<CriteriaKind, Arc<dyn ScoringStrategy>>>,
    pub retry_policy: RetryPolicy,
    pub breakers: BreakerRegistry,
    pub parallel: usize,
}

impl SuiteRunner {
    pub fn new(
        invoker: Arc<dyn VersionClient>,
        strategies: Vec<Arc<dyn ScoringStrategy>>,
        retry_policy: RetryPolicy,
        breakers: BreakerRegistry,
        parallel: usize,
    ) -> Self {
        let strategies = strategies.into_iter().map(|s| (s.kind(), s)).collect();
        SuiteRunner {
            invoker,
            strategies: Arc::new(strategies),
            retry_policy,
            breakers,
            parallel: parallel.max(1),
        }
    }

    /// Run every test case against `version_id`, at most `parallel` at a
    /// time. Results come back in suite order regardless of completion
    /// order.
    pub async fn execute(
        &self,
        tenant: &str,
        version_id: &str,
        cases: &[TestCase],
    ) -> Result<SuiteOutcome, EngineError> {
        let sem = Arc::new(Semaphore::new(self.parallel));
        let mut handles = Vec::new();

        for tc in cases {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Invariant(format!("semaphore closed: {e}")))?;
            let this = self.clone();
            let tenant = tenant.to_string();
            let version_id = version_id.to_string();
            let tc = tc.clone();
            let h = tokio::spawn(async move {
                let _permit = permit;
                this.score_case(&tenant, &version_id, &tc).await
            });
            handles.push(h);
        }

        let mut outcome = SuiteOutcome::default();
        for (tc, h) in cases.iter().zip(handles) {
            let case = match h.await {
                Ok(case) => case,
                Err(e) => CaseScore::errored(&tc.id, format!("join error: {e}"), None),
            };
            outcome.tokens += case.tokens;
            outcome.cost_usd += case.cost_usd;
            outcome.results.push(case.result);
        }
        Ok(outcome)
    }

    async fn score_case(&self, tenant: &str, version_id: &str, tc: &TestCase) -> CaseScore {
        let started = std::time::Instant::now();

        let invocation = match self.invoke_with_resilience(version_id, &tc.input).await {
            Ok(inv) => inv,
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as u64;
                return CaseScore::errored(&tc.id, e.to_string(), Some(elapsed));
            }
        };
        let tokens = invocation.tokens;
        let cost_usd = invocation.cost_usd;

        let scored = self.apply_strategy(tenant, tc, &invocation.output).await;
        let elapsed = started.elapsed().as_millis() as u64;
        let result = match scored {
            Ok(outcome) => TestCaseResult {
                test_case_id: tc.id.clone(),
                passed: outcome.passed,
                score: Some(outcome.score),
                output: invocation.output,
                error: None,
                execution_ms: Some(elapsed),
            },
            Err(e) => TestCaseResult {
                test_case_id: tc.id.clone(),
                passed: false,
                score: Some(0.0),
                output: invocation.output,
                error: Some(e.to_string()),
                execution_ms: Some(elapsed),
            },
        };
        CaseScore {
            result,
            tokens,
            cost_usd,
        }
    }

    /// Each physical attempt passes through the breaker, so the breaker
    /// sees real failures as they happen. `CircuitOpen` is not transient,
    /// which stops the retry loop as soon as the circuit trips.
    async fn invoke_with_resilience(
        &self,
        version_id: &str,
        input: &Value,
    ) -> Result<Invocation, EngineError> {
        retry(&self.retry_policy, EngineError::is_transient, || {
            self.invoke_once(version_id, input)
        })
        .await
    }

    async fn invoke_once(&self, version_id: &str, input: &Value) -> Result<Invocation, EngineError> {
        match self.breakers.get(INVOKER_BREAKER) {
            Some(b) => b.call(|| self.invoker.invoke(version_id, input)).await,
            None => self.invoker.invoke(version_id, input).await,
        }
    }

    async fn apply_strategy(
        &self,
        tenant: &str,
        tc: &TestCase,
        actual: &Value,
    ) -> Result<crate::scoring_api::ScoreOutcome, EngineError> {
        let kind = tc
            .criteria
            .as_ref()
            .map(|c| c.kind())
            .unwrap_or(CriteriaKind::ExactMatch);
        let strategy = self.strategies.get(&kind).ok_or_else(|| {
            EngineError::Validation(format!("no scoring strategy registered for '{kind}'"))
        })?;
        strategy
            .score(
                tenant,
                &tc.input,
                &tc.expected_output,
                actual,
                tc.criteria.as_ref(),
            )
            .await
    }
}

struct CaseScore {
    result: TestCaseResult,
    tokens: u64,
    cost_usd: f64,
}

impl CaseScore {
    fn errored(test_case_id: &str, error: String, execution_ms: Option<u64>) -> Self {
        CaseScore {
            result: TestCaseResult {
                test_case_id: test_case_id.into(),
                passed: false,
                score: Some(0.0),
                output: Value::Null,
                error: Some(error),
                execution_ms,
            },
            tokens: 0,
            cost_usd: 0.0,
        }
    }
}
