use std::io::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::{Sandbox, SandboxLimits, SandboxRun};
use crate::errors::SandboxError;

/// Minimal PATH for the child; the parent environment is never inherited.
const CHILD_PATH: &str = "/usr/bin:/bin";

const STDERR_EXCERPT_CHARS: usize = 400;

/// Runs scoring code in a fresh interpreter child per invocation.
///
/// The arguments arrive as one JSON object on the child's stdin, and the
/// score is the child's entire stdout parsed as a number in [0,1]. The
/// wall-clock budget kills the child on expiry; `kill_on_drop` covers every
/// other exit path, including task cancellation. On unix the address space
/// is capped via `setrlimit` before exec.
pub struct ProcessSandbox {
    program: String,
    check_flag: String,
}

impl ProcessSandbox {
    /// `program` is the interpreter binary (absolute path; the child PATH is
    /// minimal), `check_flag` its syntax-check switch.
    pub fn new(program: impl Into<String>, check_flag: impl Into<String>) -> Self {
        ProcessSandbox {
            program: program.into(),
            check_flag: check_flag.into(),
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        ProcessSandbox::new("/bin/sh", "-n")
    }
}

#[async_trait::async_trait]
impl Sandbox for ProcessSandbox {
    async fn compile(&self, code: &str) -> Result<(), SandboxError> {
        let script = write_script(code)?;
        let output = Command::new(&self.program)
            .arg(&self.check_flag)
            .arg(script.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .env_clear()
            .env("PATH", CHILD_PATH)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Compile(excerpt(&output.stderr)))
        }
    }

    async fn run(&self, code: &str, args: &Value, limits: &SandboxLimits) -> SandboxRun {
        let started = Instant::now();
        let script = match write_script(code) {
            Ok(s) => s,
            Err(e) => return SandboxRun::failed(e, 0),
        };

        let mut cmd = Command::new(&self.program);
        cmd.arg(script.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env("PATH", CHILD_PATH)
            .kill_on_drop(true);

        #[cfg(unix)]
        apply_memory_limit(&mut cmd, limits.memory_mb);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return SandboxRun::failed(SandboxError::Spawn(e.to_string()), ms(started))
            }
        };

        let payload = format!("{args}\n");
        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let io = async {
            if let Some(mut pipe) = stdin.take() {
                // EPIPE here just means the script never reads stdin.
                let _ = pipe.write_all(payload.as_bytes()).await;
                let _ = pipe.shutdown().await;
            }
            let mut out = Vec::new();
            let mut err = Vec::new();
            let _ = tokio::join!(
                async {
                    if let Some(pipe) = stdout.as_mut() {
                        let _ = pipe.read_to_end(&mut out).await;
                    }
                },
                async {
                    if let Some(pipe) = stderr.as_mut() {
                        let _ = pipe.read_to_end(&mut err).await;
                    }
                },
            );
            let status = child.wait().await;
            (status, out, err)
        };

        let budget = Duration::from_millis(limits.timeout_ms);
        let (status, out, err) = match tokio::time::timeout(budget, io).await {
            Ok(done) => done,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return SandboxRun::failed(
                    SandboxError::Timeout {
                        limit_ms: limits.timeout_ms,
                    },
                    ms(started),
                );
            }
        };

        let elapsed_ms = ms(started);
        let status = match status {
            Ok(s) => s,
            Err(e) => return SandboxRun::failed(SandboxError::Spawn(e.to_string()), elapsed_ms),
        };

        if !status.success() {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if status.signal() == Some(libc::SIGKILL) {
                    return SandboxRun::failed(
                        SandboxError::MemoryExceeded {
                            limit_mb: limits.memory_mb,
                        },
                        elapsed_ms,
                    );
                }
            }
            let detail = if err.is_empty() {
                status.to_string()
            } else {
                excerpt(&err)
            };
            return SandboxRun::failed(SandboxError::Crashed(detail), elapsed_ms);
        }

        let text = String::from_utf8_lossy(&out);
        let score: f64 = match text.trim().parse() {
            Ok(v) => v,
            Err(_) => return SandboxRun::failed(SandboxError::NonNumericScore, elapsed_ms),
        };
        if !(0.0..=1.0).contains(&score) {
            return SandboxRun::failed(SandboxError::ScoreOutOfRange(score), elapsed_ms);
        }
        SandboxRun::scored(score, elapsed_ms)
    }
}

fn write_script(code: &str) -> Result<NamedTempFile, SandboxError> {
    let mut file = NamedTempFile::new().map_err(|e| SandboxError::Spawn(e.to_string()))?;
    file.write_all(code.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| SandboxError::Spawn(e.to_string()))?;
    Ok(file)
}

#[cfg(unix)]
fn apply_memory_limit(cmd: &mut Command, memory_mb: u64) {
    let bytes = memory_mb.saturating_mul(1024 * 1024);
    // SAFETY: pre_exec runs after fork, before exec in the child. setrlimit
    // is async-signal-safe and the closure allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: bytes as libc::rlim_t,
                rlim_max: bytes as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn excerpt(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .trim()
        .chars()
        .take(STDERR_EXCERPT_CHARS)
        .collect()
}

fn ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
