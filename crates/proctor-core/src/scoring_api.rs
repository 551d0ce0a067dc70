//! The seam between the suite runner and the pluggable scoring strategies.
//!
//! Strategy implementations live in the `proctor-scoring` crate; the engine
//! only ever sees `Arc<dyn ScoringStrategy>` and dispatches by
//! [`CriteriaKind`]. A strategy error never reaches the caller of the suite
//! runner: the runner converts it into a failed `TestCaseResult`.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::EngineError;
use crate::model::{CriteriaKind, ScoringCriteria};

/// Judgment for a single test case: pass/fail plus a score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutcome {
    pub passed: bool,
    pub score: f64,
}

impl ScoreOutcome {
    pub fn pass(score: f64) -> Self {
        ScoreOutcome {
            passed: true,
            score,
        }
    }

    pub fn fail(score: f64) -> Self {
        ScoreOutcome {
            passed: false,
            score,
        }
    }
}

#[async_trait]
pub trait ScoringStrategy: Send + Sync {
    /// Which `criteria.type` this strategy answers for.
    fn kind(&self) -> CriteriaKind;

    /// Score one test case. `criteria` is the case's own criteria (None when
    /// the case relies on the exact-match default); `tenant` scopes lookups
    /// of tenant-owned scoring functions.
    async fn score(
        &self,
        tenant: &str,
        input: &Value,
        expected: &Value,
        actual: &Value,
        criteria: Option<&ScoringCriteria>,
    ) -> Result<ScoreOutcome, EngineError>;
}
