use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::sandbox::SandboxLimits;

/// Engine configuration, loaded from `proctor.yaml`. Every section has
/// usable defaults; an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub db: String,
    /// Concurrent test cases per run.
    pub parallel: usize,
    pub cron: CronSection,
    pub sandbox: SandboxSection,
    pub retry: RetrySection,
    pub breaker: BreakerSection,
    pub invoker: InvokerSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            db: "proctor.db".into(),
            parallel: 4,
            cron: CronSection::default(),
            sandbox: SandboxSection::default(),
            retry: RetrySection::default(),
            breaker: BreakerSection::default(),
            invoker: InvokerSection::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db.trim().is_empty() {
            return Err(ConfigError("db path is empty".into()));
        }
        if self.parallel == 0 {
            return Err(ConfigError("parallel must be at least 1".into()));
        }
        if self.cron.batch_size == 0 {
            return Err(ConfigError("cron.batch_size must be at least 1".into()));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError("sandbox.timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronSection {
    pub interval_secs: u64,
    /// PENDING runs picked up per tenant per tick.
    pub batch_size: u32,
}

impl Default for CronSection {
    fn default() -> Self {
        CronSection {
            interval_secs: 300,
            batch_size: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Interpreter binary for scoring code; absolute path, the child gets a
    /// minimal PATH.
    pub program: String,
    /// The interpreter's syntax-check switch.
    pub check_flag: String,
    pub memory_mb: u64,
    pub timeout_ms: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        SandboxSection {
            program: "/bin/sh".into(),
            check_flag: "-n".into(),
            memory_mb: 128,
            timeout_ms: 5_000,
        }
    }
}

impl SandboxSection {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            memory_mb: self.memory_mb,
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub attempt_timeout_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        RetrySection {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: 60_000,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        BreakerSection {
            failure_threshold: 5,
            reset_timeout_secs: 30,
            call_timeout_secs: 60,
        }
    }
}

impl BreakerSection {
    pub fn config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

/// Version-invocation service endpoint. An empty base_url selects the
/// built-in echo invoker, which is only useful for local smoke runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerSection {
    pub base_url: String,
    pub api_key: Option<String>,
}

pub fn load_config(path: &Path, strict: bool) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;

    let mut ignored_keys = BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);
    let cfg: EngineConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    if !ignored_keys.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "unknown fields in strict mode: {:?} (file: {})",
                ignored_keys,
                path.display()
            )));
        }
        tracing::warn!(fields = ?ignored_keys, "ignoring unknown config fields");
    }

    cfg.validate()?;
    Ok(cfg)
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"db: proctor.db
parallel: 4
cron:
  interval_secs: 300
  batch_size: 5
sandbox:
  program: /bin/sh
  check_flag: "-n"
  memory_mb: 128
  timeout_ms: 5000
retry:
  max_attempts: 3
  initial_delay_ms: 1000
  max_delay_ms: 30000
  multiplier: 2.0
  jitter: true
  attempt_timeout_ms: 60000
breaker:
  failure_threshold: 5
  reset_timeout_secs: 30
  call_timeout_secs: 60
invoker:
  base_url: ""
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn empty_config_uses_defaults() {
        let f = write_temp("{}");
        let cfg = load_config(f.path(), true).unwrap();
        assert_eq!(cfg.db, "proctor.db");
        assert_eq!(cfg.cron.batch_size, 5);
        assert_eq!(cfg.sandbox.program, "/bin/sh");
        assert_eq!(cfg.retry.policy().max_attempts, 3);
        assert_eq!(cfg.breaker.config().failure_threshold, 5);
    }

    #[test]
    fn unknown_keys_fail_only_in_strict_mode() {
        let f = write_temp("db: x.db\nturbo_mode: true\n");
        assert!(load_config(f.path(), false).is_ok());
        let err = load_config(f.path(), true).unwrap_err();
        assert!(err.to_string().contains("turbo_mode"));
    }

    #[test]
    fn zero_parallel_is_rejected() {
        let f = write_temp("parallel: 0\n");
        assert!(load_config(f.path(), false).is_err());
    }

    #[test]
    fn sample_config_loads_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proctor.yaml");
        write_sample_config(&path).unwrap();
        let cfg = load_config(&path, true).unwrap();
        assert_eq!(cfg.sandbox.timeout_ms, 5_000);
        assert!(cfg.invoker.base_url.is_empty());
    }
}
