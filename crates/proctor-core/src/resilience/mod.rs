//! Resilience primitives wrapped around flaky collaborator calls:
//! per-attempt timeouts with exponential backoff ([`retry`]), and a
//! named circuit breaker registry built once at startup ([`BreakerRegistry`]).

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use retry::{retry, retry_batch, RetryPolicy};
