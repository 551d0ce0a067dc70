use crate::model::RunStatus;

/// Engine-level error taxonomy. Storage plumbing converts into `Storage`;
/// per-test-case scorer errors are caught by the suite runner and become
/// failed results instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    /// Claim lost: the run was not PENDING when we tried to take it.
    #[error("Run is already {status}")]
    ClaimLost { status: RunStatus },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invoker error: {0}")]
    Invoker(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Default retry classification for collaborator calls: transient
    /// transport/storage trouble retries, everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. } | EngineError::Storage(_) | EngineError::Invoker(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("serialization: {e}"))
    }
}

/// Raised while loading or validating the engine configuration file.
#[derive(Debug, thiserror::Error)]
#[error("ConfigError: {0}")]
pub struct ConfigError(pub String);

/// Failures of a single sandboxed execution of untrusted scoring code.
///
/// Every variant fails only the affected test case (or example); the sandbox
/// hands out a fresh context per call, so nothing leaks into the next one.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("scoring code must produce a numeric score")]
    NonNumericScore,

    #[error("score must be between 0 and 1 (got {0})")]
    ScoreOutOfRange(f64),

    #[error("execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("memory limit exceeded ({limit_mb}MB)")]
    MemoryExceeded { limit_mb: u64 },

    #[error("scoring code exited with an error: {0}")]
    Crashed(String),

    #[error("scoring code failed to compile: {0}")]
    Compile(String),

    #[error("sandbox could not start: {0}")]
    Spawn(String),
}
