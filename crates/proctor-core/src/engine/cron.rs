use std::time::Duration;

use serde::Serialize;

use crate::errors::EngineError;
use crate::model::RunStatus;
use crate::storage::Store;

use super::run_executor::RunExecutor;

/// One tenant's slice of a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct TenantSweep {
    pub tenant: String,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub claim_lost: usize,
}

/// Aggregate of one dispatcher tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub claim_lost: usize,
    pub tenants: Vec<TenantSweep>,
}

/// Periodically sweeps PENDING runs into the executor, fair across tenants.
pub struct CronDispatcher {
    pub store: Store,
    pub executor: RunExecutor,
    /// PENDING runs picked up per tenant per tick.
    pub batch_size: u32,
}

impl CronDispatcher {
    /// One sweep: for each tenant with PENDING runs, execute up to
    /// `batch_size` of them, oldest first.
    ///
    /// A failing run is counted and the sweep moves on. Claim losses are
    /// routine (another dispatcher got there first) and logged at debug.
    pub async fn tick(&self) -> Result<TickSummary, EngineError> {
        let mut summary = TickSummary::default();
        for tenant in self.store.tenants_with_pending()? {
            let run_ids = self.store.pending_runs(&tenant, self.batch_size)?;
            let mut sweep = TenantSweep {
                tenant: tenant.clone(),
                processed: 0,
                completed: 0,
                failed: 0,
                claim_lost: 0,
            };
            for run_id in run_ids {
                sweep.processed += 1;
                match self.executor.execute(run_id).await {
                    Ok(outcome) => {
                        // Cancelled mid-run counts as processed only.
                        if outcome.status == RunStatus::Completed {
                            sweep.completed += 1;
                        }
                    }
                    Err(EngineError::ClaimLost { status }) => {
                        sweep.claim_lost += 1;
                        tracing::debug!(run_id, status = %status, "run claimed elsewhere");
                    }
                    Err(e) => {
                        sweep.failed += 1;
                        tracing::warn!(run_id, tenant = %tenant, error = %e, "scheduled run failed");
                    }
                }
            }
            summary.processed += sweep.processed;
            summary.completed += sweep.completed;
            summary.failed += sweep.failed;
            summary.claim_lost += sweep.claim_lost;
            summary.tenants.push(sweep);
        }
        Ok(summary)
    }

    /// Sweep every `interval`, forever. The first sweep fires immediately.
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(summary) if summary.processed > 0 => {
                    tracing::info!(
                        processed = summary.processed,
                        completed = summary.completed,
                        failed = summary.failed,
                        claim_lost = summary.claim_lost,
                        "sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "sweep failed"),
            }
        }
    }
}
