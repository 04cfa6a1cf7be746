use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{ExecRequest, ExecResult};

/// Upper bound when a request carries no timeout of its own.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Wraps `tokio::process::Command` with env filtering, output limits,
/// timeout, and kill. Used by `LocalHostProvider`.
pub struct ProcessSupervisor {
    /// Environment variables to inherit from host (allowlist).
    pub env_allowlist: Vec<String>,
    /// Maximum bytes kept per stream; the rest is drained and dropped.
    pub max_output_bytes: usize,
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            env_allowlist,
            max_output_bytes,
        }
    }

    /// Build a filtered env map: only allowlisted host vars + request vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    /// Run a command to completion, capturing output.
    ///
    /// A timeout kills the child and is reported through `timed_out`, not
    /// as an error.
    pub async fn exec(&self, req: &ExecRequest, working_dir: &Path) -> Result<ExecResult, SandboxError> {
        let Some((program, args)) = req.command.split_first() else {
            return Err(SandboxError::Exec("empty command".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(working_dir);
        cmd.env_clear();
        for (k, v) in self.build_env(&req.env) {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Exec("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Exec("stderr not captured".into()))?;

        let max_bytes = self.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(stdout, max_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr, max_bytes));

        let timeout_dur = req.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
        let (timed_out, exit_code) = match tokio::time::timeout(timeout_dur, child.wait()).await {
            Ok(Ok(status)) => (false, status.code()),
            Ok(Err(e)) => return Err(SandboxError::Exec(format!("wait failed: {e}"))),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill timed-out process");
                }
                (true, None)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

/// Read a pipe to EOF, keeping at most `max_bytes`.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max_bytes.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(vec!["PATH".into()], 1024 * 1024)
    }

    fn request(command: &[&str], timeout: Duration) -> ExecRequest {
        ExecRequest {
            command: command.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: Some(timeout),
        }
    }

    #[tokio::test]
    async fn exec_echo() {
        let result = supervisor()
            .exec(&request(&["echo", "hello sandbox"], Duration::from_secs(5)), &PathBuf::from("."))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "hello sandbox");
    }

    #[tokio::test]
    async fn exec_nonzero_exit() {
        let result = supervisor()
            .exec(&request(&["bash", "-c", "echo oops >&2; exit 42"], Duration::from_secs(5)), &PathBuf::from("."))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(42));
        assert_eq!(String::from_utf8_lossy(&result.stderr).trim(), "oops");
    }

    #[tokio::test]
    async fn exec_timeout() {
        let result = supervisor()
            .exec(&request(&["sleep", "60"], Duration::from_millis(200)), &PathBuf::from("."))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn exec_env_filtering() {
        let mut req = request(&["bash", "-c", "echo \"$DB_HOST|$HOME\""], Duration::from_secs(5));
        req.env.insert("DB_HOST".into(), "db.internal".into());

        let result = supervisor().exec(&req, &PathBuf::from(".")).await.unwrap();
        // HOME is not on the allowlist
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "db.internal|");
    }

    #[tokio::test]
    async fn exec_output_is_capped() {
        let sup = ProcessSupervisor::new(vec!["PATH".into()], 16);
        let result = sup
            .exec(&request(&["bash", "-c", "head -c 1000 /dev/zero | tr '\\0' x"], Duration::from_secs(5)), &PathBuf::from("."))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.len(), 16);
    }

    #[tokio::test]
    async fn exec_empty_command_errors() {
        let req = ExecRequest {
            command: vec![],
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        };
        assert!(supervisor().exec(&req, &PathBuf::from(".")).await.is_err());
    }
}
