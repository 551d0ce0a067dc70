use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::errors::EngineError;

/// Breaker states. `Open` rejects calls without invoking the operation;
/// `HalfOpen` lets exactly one trial through to probe recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    pub reset_timeout: Duration,
    /// Ceiling on each guarded call; a timeout counts as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

struct BreakerCore {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one named downstream dependency.
///
/// State transitions happen under a mutex held only for bookkeeping; the
/// guarded future itself runs with the lock released.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
}

/// What the pre-call check decided for this invocation.
enum Admission {
    Rejected,
    Normal,
    Trial,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        match self.core.lock() {
            Ok(core) => core.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Open breakers fail fast with [`EngineError::CircuitOpen`] and never
    /// invoke `op`. Once the reset timeout has elapsed the breaker moves to
    /// half-open and admits a single trial call; success closes the breaker,
    /// failure reopens it and restarts the timeout.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let admission = self.admit();
        if matches!(admission, Admission::Rejected) {
            return Err(EngineError::CircuitOpen {
                name: self.name.clone(),
            });
        }

        let result = match tokio::time::timeout(self.config.call_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(EngineError::Timeout {
                ms: self.config.call_timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        match self.core.lock() {
            Ok(core) => core,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn admit(&self) -> Admission {
        let mut core = self.lock();
        match core.state {
            BreakerState::Closed => Admission::Normal,
            BreakerState::Open => {
                let expired = core
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if expired {
                    core.state = BreakerState::HalfOpen;
                    core.trial_in_flight = true;
                    tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if core.trial_in_flight {
                    Admission::Rejected
                } else {
                    core.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    fn on_success(&self) {
        let mut core = self.lock();
        if core.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, "circuit breaker closed");
        }
        core.state = BreakerState::Closed;
        core.consecutive_failures = 0;
        core.opened_at = None;
        core.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut core = self.lock();
        match core.state {
            BreakerState::HalfOpen => {
                core.state = BreakerState::Open;
                core.opened_at = Some(Instant::now());
                core.trial_in_flight = false;
                tracing::warn!(breaker = %self.name, "trial call failed, circuit breaker reopened");
            }
            BreakerState::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.config.failure_threshold {
                    core.state = BreakerState::Open;
                    core.opened_at = Some(Instant::now());
                    tracing::warn!(
                        breaker = %self.name,
                        failures = core.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {
                // Late failure from a call admitted before the breaker
                // opened. Keep the existing open window.
            }
        }
    }
}

/// Named breakers built once at startup and shared by reference.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(breakers: Vec<CircuitBreaker>) -> Self {
        let map = breakers
            .into_iter()
            .map(|b| (b.name.clone(), Arc::new(b)))
            .collect();
        BreakerRegistry {
            breakers: Arc::new(map),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(|| async { Err::<(), _>(EngineError::Invoker("boom".into())) })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("invoker", test_config());
        for _ in 0..2 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("invoker", test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let calls = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("invoker", test_config());
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.call(|| async { Ok::<_, EngineError>(()) }).await.unwrap();

        // Two more failures should not reach the threshold of three.
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_closes_breaker() {
        let breaker = CircuitBreaker::new("invoker", test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        breaker.call(|| async { Ok::<_, EngineError>(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // And calls flow normally again.
        breaker.call(|| async { Ok::<_, EngineError>(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens_breaker() {
        let breaker = CircuitBreaker::new("invoker", test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // The reset window restarted; still rejecting before it elapses.
        tokio::time::advance(Duration::from_secs(10)).await;
        let result = breaker.call(|| async { Ok::<_, EngineError>(()) }).await;
        assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let breaker = Arc::new(CircuitBreaker::new("invoker", test_config()));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        // First caller takes the trial slot and parks inside the call.
        let b = breaker.clone();
        let trial = tokio::spawn(async move {
            b.call(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, EngineError>(())
            })
            .await
        });
        tokio::task::yield_now().await;

        // Second caller is rejected while the trial is in flight.
        let result = breaker.call(|| async { Ok::<_, EngineError>(()) }).await;
        assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_millis(100)).await;
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_counts_as_failure() {
        let config = BreakerConfig {
            failure_threshold: 1,
            call_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let breaker = CircuitBreaker::new("invoker", config);

        let result = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, EngineError>(())
            })
            .await;

        assert!(matches!(result, Err(EngineError::Timeout { ms: 50 })));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn registry_lookup() {
        let registry = BreakerRegistry::new(vec![
            CircuitBreaker::new("invoker", BreakerConfig::default()),
            CircuitBreaker::new("registry", BreakerConfig::default()),
        ]);
        assert!(registry.get("invoker").is_some());
        assert!(registry.get("nonexistent").is_none());
    }
}
