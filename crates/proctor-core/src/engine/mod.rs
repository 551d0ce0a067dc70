pub mod cron;
pub mod run_executor;
pub mod suite_runner;

pub use cron::{CronDispatcher, TenantSweep, TickSummary};
pub use run_executor::{RunExecutor, RunOutcome};
pub use suite_runner::{SuiteOutcome, SuiteRunner, INVOKER_BREAKER};
