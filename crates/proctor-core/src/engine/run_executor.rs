use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::collab::{best_effort, CostLedger, NotificationSink};
use crate::errors::EngineError;
use crate::metrics;
use crate::model::{
    CostRecord, EvaluationRun, NotificationEvent, NotificationKind, RunMetrics, RunStatus,
};
use crate::resilience::retry;
use crate::storage::Store;

use super::suite_runner::SuiteRunner;

/// What one execution attempt produced. `metrics` is present only when the
/// run completed.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: i64,
    pub status: RunStatus,
    pub metrics: Option<RunMetrics>,
}

/// Drives one run through claim → execute → finalize.
///
/// Exactly-once execution rests entirely on [`Store::claim_pending`]: of N
/// concurrent executors, the transaction winner proceeds and the others get
/// [`EngineError::ClaimLost`]. Anything that goes wrong after the claim is
/// recorded best-effort as FAILED and rethrown.
#[derive(Clone)]
pub struct RunExecutor {
    pub store: Store,
    pub runner: SuiteRunner,
    pub ledger: Arc<dyn CostLedger>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl RunExecutor {
    pub async fn execute(&self, run_id: i64) -> Result<RunOutcome, EngineError> {
        let claim = self.store.claim_pending(run_id)?;
        if !claim.claimed {
            return Err(EngineError::ClaimLost {
                status: claim.status,
            });
        }

        match self.run_claimed(run_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(run_id, &e).await;
                Err(e)
            }
        }
    }

    async fn run_claimed(&self, run_id: i64) -> Result<RunOutcome, EngineError> {
        let run = self.store.get_run(run_id)?;
        // Suite snapshot as of the claim; edits after this point belong to
        // future runs.
        let suite = self.store.get_suite(&run.tenant, run.suite_id)?;

        let version = retry(&self.runner.retry_policy, EngineError::is_transient, || {
            self.runner.invoker.resolve(&run.version_id)
        })
        .await?;
        tracing::debug!(run_id, version = %version.id, cases = suite.test_cases.len(), "run claimed");

        let outcome = self
            .runner
            .execute(&run.tenant, &run.version_id, &suite.test_cases)
            .await?;
        let metrics = metrics::reduce(&outcome.results);

        let final_status = self
            .store
            .finalize_completed(run_id, &outcome.results, &metrics)?;
        if final_status == RunStatus::Cancelled {
            tracing::info!(run_id, "cancelled while executing; results discarded");
            return Ok(RunOutcome {
                run_id,
                status: RunStatus::Cancelled,
                metrics: None,
            });
        }

        self.record_success(&run, &metrics, outcome.tokens, outcome.cost_usd)
            .await;
        Ok(RunOutcome {
            run_id,
            status: RunStatus::Completed,
            metrics: Some(metrics),
        })
    }

    async fn record_success(
        &self,
        run: &EvaluationRun,
        metrics: &RunMetrics,
        tokens: u64,
        cost_usd: f64,
    ) {
        best_effort(
            "cost record",
            self.ledger.record(&CostRecord {
                tenant: run.tenant.clone(),
                run_id: run.id,
                tokens,
                cost_usd,
                source: "invoker".into(),
            }),
        )
        .await;
        best_effort(
            "completion notification",
            self.notifier.create(&NotificationEvent {
                tenant: run.tenant.clone(),
                kind: NotificationKind::RunCompleted,
                resource_type: "evaluation_run".into(),
                resource_id: run.id.to_string(),
                payload: json!({
                    "pass_rate": metrics.pass_rate,
                    "overall_score": metrics.overall_score,
                    "total_tests": metrics.total_tests,
                }),
            }),
        )
        .await;
    }

    /// Best-effort failure bookkeeping. The original error is what the
    /// caller sees; nothing in here may replace it.
    async fn record_failure(&self, run_id: i64, error: &EngineError) {
        let wrote = match self.store.mark_failed(run_id, &error.to_string()) {
            Ok(wrote) => wrote,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "could not record run failure");
                false
            }
        };
        if !wrote {
            return;
        }
        let tenant = match self.store.get_run(run_id) {
            Ok(run) => run.tenant,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "could not load run for failure notification");
                return;
            }
        };
        best_effort(
            "failure notification",
            self.notifier.create(&NotificationEvent {
                tenant,
                kind: NotificationKind::RunFailed,
                resource_type: "evaluation_run".into(),
                resource_id: run_id.to_string(),
                payload: json!({ "error": error.to_string() }),
            }),
        )
        .await;
    }
}
