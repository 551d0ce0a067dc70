//! Isolated execution of tenant-supplied scoring code.
//!
//! The engine never interprets untrusted code in-process. Everything goes
//! through the [`Sandbox`] trait; the shipped [`ProcessSandbox`] runs each
//! invocation in a short-lived child process with a scrubbed environment
//! and hard resource ceilings.

pub mod process;

pub use process::ProcessSandbox;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SandboxError;

/// Resource ceilings for one sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub timeout_ms: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            memory_mb: 128,
            timeout_ms: 5_000,
        }
    }
}

/// Outcome of a single sandboxed invocation. Failures of the scoring code
/// itself land in `error` rather than bubbling up, so one bad test case
/// cannot take down a whole suite.
#[derive(Debug)]
pub struct SandboxRun {
    pub score: Option<f64>,
    pub error: Option<SandboxError>,
    pub elapsed_ms: u64,
}

impl SandboxRun {
    pub(crate) fn scored(score: f64, elapsed_ms: u64) -> Self {
        SandboxRun {
            score: Some(score),
            error: None,
            elapsed_ms,
        }
    }

    pub(crate) fn failed(error: SandboxError, elapsed_ms: u64) -> Self {
        SandboxRun {
            score: None,
            error: Some(error),
            elapsed_ms,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.score.is_some()
    }

    /// Flatten into the score, surfacing any execution failure.
    pub fn into_score(self) -> Result<f64, SandboxError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.score.ok_or(SandboxError::NonNumericScore)
    }
}

/// Executes untrusted scoring code with no state carried between calls.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Syntax-check `code` without running it.
    async fn compile(&self, code: &str) -> Result<(), SandboxError>;

    /// Run `code` with `args` bound as a single JSON object on stdin.
    async fn run(&self, code: &str, args: &Value, limits: &SandboxLimits) -> SandboxRun;
}
