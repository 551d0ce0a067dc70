//! Run-level metric aggregation.
//!
//! Historical records persisted pass rates on two scales (0-100 and 0-1),
//! so every read path and every batch correction goes through
//! [`normalize_rate`] before a rate reaches a caller.

use crate::model::{RunMetrics, TestCaseResult};

/// Collapse a rate from whichever scale it was stored on to [0, 1].
///
/// NaN becomes 0. A magnitude above 1 is taken to be a legacy percentage
/// and divided by 100. Anything else passes through unchanged.
pub fn normalize_rate(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    if x.abs() > 1.0 {
        return x / 100.0;
    }
    x
}

/// Reduce per-case results into run-level metrics.
///
/// Missing scores and missing execution times count as 0 in their means.
/// An empty slice yields all zeros rather than dividing by zero.
pub fn reduce(results: &[TestCaseResult]) -> RunMetrics {
    let total_tests = results.len();
    if total_tests == 0 {
        return RunMetrics::empty();
    }

    let passed = results.iter().filter(|r| r.passed).count();
    let score_sum: f64 = results.iter().map(|r| r.score.unwrap_or(0.0)).sum();
    let time_sum: f64 = results
        .iter()
        .map(|r| r.execution_ms.unwrap_or(0) as f64)
        .sum();

    RunMetrics {
        total_tests,
        passed,
        failed: total_tests - passed,
        pass_rate: passed as f64 / total_tests as f64,
        overall_score: score_sum / total_tests as f64,
        avg_execution_ms: time_sum / total_tests as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(passed: bool, score: Option<f64>, ms: Option<u64>) -> TestCaseResult {
        TestCaseResult {
            test_case_id: "t".into(),
            passed,
            score,
            output: serde_json::Value::Null,
            error: None,
            execution_ms: ms,
        }
    }

    #[test]
    fn normalize_rate_handles_legacy_scales() {
        assert_eq!(normalize_rate(55.0), 0.55);
        assert_eq!(normalize_rate(0.7), 0.7);
        assert_eq!(normalize_rate(f64::NAN), 0.0);
        assert_eq!(normalize_rate(1.0), 1.0);
        assert_eq!(normalize_rate(0.0), 0.0);
        assert_eq!(normalize_rate(-80.0), -0.8);
    }

    #[test]
    fn reduce_empty_is_all_zeros() {
        let m = reduce(&[]);
        assert_eq!(m.total_tests, 0);
        assert_eq!(m.pass_rate, 0.0);
        assert_eq!(m.overall_score, 0.0);
        assert_eq!(m.avg_execution_ms, 0.0);
    }

    #[test]
    fn reduce_counts_missing_scores_as_zero() {
        let m = reduce(&[
            result(true, Some(1.0), Some(10)),
            result(false, None, None),
        ]);
        assert_eq!(m.total_tests, 2);
        assert_eq!(m.passed, 1);
        assert_eq!(m.failed, 1);
        assert_eq!(m.pass_rate, 0.5);
        assert_eq!(m.overall_score, 0.5);
        assert_eq!(m.avg_execution_ms, 5.0);
    }
}
