//! Registration and verification of tenant-supplied scoring functions.

use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, SandboxError};
use crate::model::{CustomScoringFunction, FunctionMetadata};
use crate::sandbox::{Sandbox, SandboxLimits};
use crate::storage::Store;

/// Scores within this distance of the example's expected score count as
/// matching; anything looser would paper over real drift in the code.
const SCORE_TOLERANCE: f64 = 1e-9;

/// Outcome of replaying one metadata example against the stored code.
#[derive(Debug, Clone, Serialize)]
pub struct ExampleReport {
    pub index: usize,
    pub passed: bool,
    pub score: Option<f64>,
    pub expected_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct FunctionRegistry {
    store: Store,
    sandbox: Arc<dyn Sandbox>,
    limits: SandboxLimits,
}

impl FunctionRegistry {
    pub fn new(store: Store, sandbox: Arc<dyn Sandbox>, limits: SandboxLimits) -> Self {
        FunctionRegistry {
            store,
            sandbox,
            limits,
        }
    }

    /// Register a new function. The code must pass the sandbox's syntax
    /// check, and the name must be unused for this tenant.
    pub async fn register(
        &self,
        tenant: &str,
        name: &str,
        code: &str,
        metadata: FunctionMetadata,
    ) -> Result<CustomScoringFunction, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("function name is empty".into()));
        }
        if code.trim().is_empty() {
            return Err(EngineError::Validation("function code is empty".into()));
        }
        self.check_compiles(code).await?;
        let digest = sha256_hex(code);
        let function = self
            .store
            .insert_function(tenant, name, code, &digest, &metadata)?;
        tracing::info!(
            tenant,
            function = name,
            id = function.id,
            "registered scoring function"
        );
        Ok(function)
    }

    /// Replace an existing function's code. The stored version bumps only
    /// when the digest actually changed.
    pub async fn update(
        &self,
        tenant: &str,
        name: &str,
        code: &str,
    ) -> Result<CustomScoringFunction, EngineError> {
        if code.trim().is_empty() {
            return Err(EngineError::Validation("function code is empty".into()));
        }
        self.check_compiles(code).await?;
        let digest = sha256_hex(code);
        self.store.update_function_code(tenant, name, code, &digest)
    }

    /// Replay every metadata example against the stored code. A sandbox
    /// failure fails that example's report and the loop keeps going.
    pub async fn test_function(&self, id: i64) -> Result<Vec<ExampleReport>, EngineError> {
        let function = self.store.function_by_id(id)?;
        let mut reports = Vec::with_capacity(function.metadata.examples.len());
        for (index, example) in function.metadata.examples.iter().enumerate() {
            let args = serde_json::json!({
                "input": example.input,
                "expected_output": example.expected_output,
                "actual_output": example.actual_output,
            });
            let run = self.sandbox.run(&function.code, &args, &self.limits).await;
            let report = match run.into_score() {
                Ok(score) => {
                    let passed = (score - example.expected_score).abs() <= SCORE_TOLERANCE;
                    ExampleReport {
                        index,
                        passed,
                        score: Some(score),
                        expected_score: example.expected_score,
                        error: (!passed).then(|| {
                            format!("expected score {}, got {score}", example.expected_score)
                        }),
                    }
                }
                Err(e) => ExampleReport {
                    index,
                    passed: false,
                    score: None,
                    expected_score: example.expected_score,
                    error: Some(e.to_string()),
                },
            };
            reports.push(report);
        }
        Ok(reports)
    }

    async fn check_compiles(&self, code: &str) -> Result<(), EngineError> {
        match self.sandbox.compile(code).await {
            Ok(()) => Ok(()),
            Err(SandboxError::Compile(msg)) => Err(EngineError::Validation(format!(
                "scoring code failed to compile: {msg}"
            ))),
            Err(other) => Err(other.into()),
        }
    }
}

fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}
