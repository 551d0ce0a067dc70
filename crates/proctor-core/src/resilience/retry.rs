use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;

use crate::errors::EngineError;

/// Backoff policy for a retried operation. Delays grow geometrically from
/// `initial_delay` up to `max_delay`; each individual attempt is raced
/// against `attempt_timeout`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based) failed, jitter
    /// not yet applied.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial_delay.mul_f64(exp);
        raw.min(self.max_delay)
    }
}

/// Symmetric ±25% jitter so synchronized retries spread out.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}

/// Run `op` up to `policy.max_attempts` times.
///
/// An attempt that outlives `attempt_timeout` fails with
/// [`EngineError::Timeout`]. A failure that `is_retryable` rejects, or a
/// failure on the final attempt, is returned immediately; otherwise the
/// caller sleeps out the backoff and tries again.
pub async fn retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    is_retryable: R,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
    R: Fn(&EngineError) -> bool,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match timeout(policy.attempt_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(EngineError::Timeout {
                ms: policy.attempt_timeout.as_millis() as u64,
            }),
        };

        let err = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if attempt >= max || !is_retryable(&err) {
            return Err(err);
        }

        let mut delay = policy.backoff(attempt);
        if policy.jitter {
            delay = jittered(delay);
        }
        tracing::debug!(
            attempt,
            max_attempts = max,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after backoff"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Retry every operation in `ops` concurrently.
///
/// If all of them fail the first error is returned. If only some fail, the
/// successful subset is returned in input order and the failure count is
/// logged; partial success is not an error.
pub async fn retry_batch<T, F, Fut, R>(
    policy: &RetryPolicy,
    is_retryable: R,
    ops: Vec<F>,
) -> Result<Vec<T>, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
    R: Fn(&EngineError) -> bool,
{
    let total = ops.len();
    let futures = ops
        .into_iter()
        .map(|op| retry(policy, &is_retryable, op))
        .collect::<Vec<_>>();
    let outcomes = futures::future::join_all(futures).await;

    let mut successes = Vec::with_capacity(total);
    let mut first_error = None;
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome {
            Ok(v) => successes.push(v),
            Err(e) => {
                failed += 1;
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if failed == total {
        if let Some(e) = first_error {
            return Err(e);
        }
        return Ok(successes); // empty input
    }
    if failed > 0 {
        tracing::warn!(failed, total, "batch completed with partial failures");
    }
    Ok(successes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
            attempt_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_op_runs_exactly_max_attempts_with_doubling_delays() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retry(&fast_policy(), |_| true, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Storage("down".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms after attempt 1, 200ms after attempt 2, none after the last.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = retry(
            &fast_policy(),
            |e| !matches!(e, EngineError::Validation(_)),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Validation("bad input".into()))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_becomes_timeout_error() {
        let policy = RetryPolicy {
            max_attempts: 1,
            attempt_timeout: Duration::from_millis(50),
            ..fast_policy()
        };

        let result: Result<(), _> = retry(&policy, |_| true, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(EngineError::Timeout { ms: 50 })));
    }

    #[tokio::test(start_paused = true)]
    async fn eventually_succeeding_op_returns_ok() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry(&fast_policy(), |_| true, move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::Storage("warming up".into()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_returns_successes_when_some_fail() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..fast_policy()
        };
        let ops: Vec<_> = (0..3)
            .map(|i| {
                move || async move {
                    if i == 1 {
                        Err(EngineError::Storage("down".into()))
                    } else {
                        Ok(i)
                    }
                }
            })
            .collect();

        let got = retry_batch(&policy, |_| true, ops).await.unwrap();
        assert_eq!(got, vec![0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_rethrows_first_error_when_all_fail() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..fast_policy()
        };
        let ops: Vec<_> = (0..2)
            .map(|i| {
                move || async move {
                    Err::<u32, _>(EngineError::Storage(format!("err-{i}")))
                }
            })
            .collect();

        let err = retry_batch(&policy, |_| true, ops).await.unwrap_err();
        assert_eq!(err.to_string(), "storage error: err-0");
    }
}
