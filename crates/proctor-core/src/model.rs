use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Run lifecycle. Only PENDING→RUNNING→{COMPLETED,FAILED,CANCELLED} are legal
/// transitions; the three latter are terminal sinks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a test case is scored. Closed union: unknown tags fail at the
/// boundary (suite import / document read) instead of surfacing mid-run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoringCriteria {
    ExactMatch,
    Contains,
    Similarity {
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },
    Custom {
        function: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },
}

impl ScoringCriteria {
    pub fn kind(&self) -> CriteriaKind {
        match self {
            ScoringCriteria::ExactMatch => CriteriaKind::ExactMatch,
            ScoringCriteria::Contains => CriteriaKind::Contains,
            ScoringCriteria::Similarity { .. } => CriteriaKind::Similarity,
            ScoringCriteria::Custom { .. } => CriteriaKind::Custom,
        }
    }
}

/// Strategy dispatch key. Absent criteria on a test case means `ExactMatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriteriaKind {
    ExactMatch,
    Contains,
    Similarity,
    Custom,
}

impl std::fmt::Display for CriteriaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CriteriaKind::ExactMatch => "exact_match",
            CriteriaKind::Contains => "contains",
            CriteriaKind::Similarity => "similarity",
            CriteriaKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub input: serde_json::Value,
    pub expected_output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<ScoringCriteria>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSuite {
    #[serde(default)]
    pub id: i64,
    pub tenant: String,
    pub name: String,
    pub test_cases: Vec<TestCase>,
}

impl EvaluationSuite {
    /// Boundary validation applied on import and again on store writes.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("suite name is empty".into()));
        }
        if self.test_cases.is_empty() {
            return Err(EngineError::Validation(format!(
                "suite '{}' has no test cases",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for tc in &self.test_cases {
            if tc.id.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "suite '{}' has a test case with an empty id",
                    self.name
                )));
            }
            if !seen.insert(tc.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate test case id '{}' in suite '{}'",
                    tc.id, self.name
                )));
            }
            if let Some(
                ScoringCriteria::Similarity { threshold: Some(t) }
                | ScoringCriteria::Custom {
                    threshold: Some(t), ..
                },
            ) = &tc.criteria
            {
                if !(0.0..=1.0).contains(t) {
                    return Err(EngineError::Validation(format!(
                        "test case '{}': threshold {} is outside [0, 1]",
                        tc.id, t
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Result of scoring one test case. Produced in the same order as the
/// suite's test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub test_case_id: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRun {
    pub id: i64,
    pub tenant: String,
    pub suite_id: i64,
    pub version_id: String,
    pub status: RunStatus,
    pub results: Option<Vec<TestCaseResult>>,
    pub overall_score: Option<f64>,
    pub pass_rate: Option<f64>,
    pub avg_execution_ms: Option<f64>,
    pub error: Option<String>,
    pub triggered_by: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Run-level aggregate. `pass_rate` and `overall_score` are always in [0, 1]
/// by the time anything reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub overall_score: f64,
    pub avg_execution_ms: f64,
}

impl RunMetrics {
    pub fn empty() -> Self {
        RunMetrics {
            total_tests: 0,
            passed: 0,
            failed: 0,
            pass_rate: 0.0,
            overall_score: 0.0,
            avg_execution_ms: 0.0,
        }
    }
}

/// Tenant roll-up over all of the tenant's runs.
#[derive(Debug, Clone, Serialize)]
pub struct TenantMetrics {
    pub tenant: String,
    pub total_runs: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean normalized pass rate across completed runs.
    pub avg_pass_rate: f64,
    /// Mean normalized overall score across completed runs.
    pub avg_overall_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomScoringFunction {
    pub id: i64,
    pub tenant: String,
    pub name: String,
    pub code: String,
    pub code_sha256: String,
    /// Monotonically incremented whenever the code digest changes.
    pub version: u32,
    pub is_active: bool,
    pub metadata: FunctionMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionMetadata {
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub return_type: String,
    #[serde(default)]
    pub examples: Vec<FunctionExample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionExample {
    pub input: serde_json::Value,
    pub expected_output: serde_json::Value,
    pub actual_output: serde_json::Value,
    pub expected_score: f64,
}

/// Outcome of a claim attempt. `claimed == false` carries the status the
/// transaction observed, which is how "Run is already {status}" gets built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimOutcome {
    pub claimed: bool,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub tenant: String,
    pub run_id: i64,
    pub tokens: u64,
    pub cost_usd: f64,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RunCompleted,
    RunFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::RunCompleted => "run_completed",
            NotificationKind::RunFailed => "run_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub tenant: String,
    pub kind: NotificationKind,
    pub resource_type: String,
    pub resource_id: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn criteria_is_a_closed_union() {
        let ok: ScoringCriteria =
            serde_json::from_value(serde_json::json!({"type": "similarity", "threshold": 0.9}))
                .unwrap();
        assert_eq!(ok.kind(), CriteriaKind::Similarity);

        let unknown = serde_json::from_value::<ScoringCriteria>(
            serde_json::json!({"type": "regex_match", "pattern": ".*"}),
        );
        assert!(unknown.is_err(), "unknown criteria tag must fail to parse");
    }

    #[test]
    fn suite_validation_rejects_duplicate_ids() {
        let suite = EvaluationSuite {
            id: 0,
            tenant: "acme".into(),
            name: "smoke".into(),
            test_cases: vec![
                TestCase {
                    id: "t1".into(),
                    name: String::new(),
                    input: serde_json::json!("hi"),
                    expected_output: serde_json::json!("hi"),
                    criteria: None,
                },
                TestCase {
                    id: "t1".into(),
                    name: String::new(),
                    input: serde_json::json!("bye"),
                    expected_output: serde_json::json!("bye"),
                    criteria: None,
                },
            ],
        };
        let err = suite.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate test case id"));
    }

    #[test]
    fn suite_validation_rejects_out_of_range_threshold() {
        let suite = EvaluationSuite {
            id: 0,
            tenant: "acme".into(),
            name: "smoke".into(),
            test_cases: vec![TestCase {
                id: "t1".into(),
                name: String::new(),
                input: serde_json::json!("hi"),
                expected_output: serde_json::json!("hi"),
                criteria: Some(ScoringCriteria::Similarity {
                    threshold: Some(1.5),
                }),
            }],
        };
        assert!(suite.validate().is_err());
    }
}
