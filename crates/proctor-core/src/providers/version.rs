use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::EngineError;

/// Identity of a deployed version under evaluation, as reported by the
/// invocation service.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
}

/// One call into the version under test, with usage for the cost ledger.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub output: Value,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// The version-invocation collaborator. Implementations must be cheap to
/// call concurrently; the engine wraps calls in its own retry/breaker layer.
#[async_trait]
pub trait VersionClient: Send + Sync {
    async fn resolve(&self, version_id: &str) -> Result<VersionInfo, EngineError>;
    async fn invoke(&self, version_id: &str, input: &Value) -> Result<Invocation, EngineError>;
}

pub struct HttpVersionClient {
    pub base_url: String,
    pub api_key: String,
    pub client: reqwest::Client,
}

impl HttpVersionClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VersionClient for HttpVersionClient {
    async fn resolve(&self, version_id: &str) -> Result<VersionInfo, EngineError> {
        let url = format!("{}/versions/{}", self.base_url, version_id);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| EngineError::Invoker(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::not_found("version", version_id));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Invoker(format!(
                "resolve {version_id}: {status}: {body}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| EngineError::Invoker(e.to_string()))
    }

    async fn invoke(&self, version_id: &str, input: &Value) -> Result<Invocation, EngineError> {
        let url = format!("{}/versions/{}/invoke", self.base_url, version_id);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(|e| EngineError::Invoker(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::not_found("version", version_id));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Invoker(format!(
                "invoke {version_id}: {status}: {body}"
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Invoker(e.to_string()))?;
        let output = json.get("output").cloned().unwrap_or(Value::Null);
        let tokens = json
            .pointer("/usage/tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let cost_usd = json
            .pointer("/usage/cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok(Invocation {
            output,
            tokens,
            cost_usd,
        })
    }
}
