//! Runs an agent's shell command inside a pooled sandbox with the target
//! database's connection details exported as environment variables and its
//! documentation mounted under `/docs`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::AdapterError;
use crate::datasources::repository::DataSourceRepository;
use crate::datasources::{DataSource, DataSourceConfig};
use crate::errors::ErrorKind;
use crate::sandbox::{ExecRequest, ExecResult, PutFileRequest, SandboxError, SandboxLease, SandboxPool};
use crate::vault::CredentialVault;

/// Runtime image every sandbox is provisioned with.
pub const SANDBOX_RUNTIME: &str = "node22";
/// Lifetime budget requested from the platform for each sandbox.
pub const SANDBOX_LIFETIME: Duration = Duration::from_secs(30 * 60);

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const DOCS_DIR: &str = "/docs";
/// Grace on top of the command timeout before the caller gives up on the
/// platform's own timeout reporting.
const EXEC_GRACE: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub database_id: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

/// Outcome before timing is attached.
#[derive(Debug)]
struct Finished {
    exit_code: i32,
    stdout: String,
    stderr: String,
    error_kind: Option<ErrorKind>,
}

impl Finished {
    fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.into(),
            error_kind: Some(kind),
        }
    }

    fn into_outcome(self, duration: Duration, executed_at: DateTime<Utc>) -> ExecutionOutcome {
        ExecutionOutcome {
            success: self.error_kind.is_none() && self.exit_code == 0,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            hint: self.error_kind.map(|k| k.hint().to_string()),
            error_kind: self.error_kind,
            duration_ms: duration.as_millis() as u64,
            executed_at,
        }
    }
}

/// Clamp a caller-supplied timeout into `(0, MAX_COMMAND_TIMEOUT]`.
pub fn clamp_timeout(timeout_ms: Option<u64>) -> Duration {
    match timeout_ms {
        None | Some(0) => DEFAULT_COMMAND_TIMEOUT,
        Some(ms) => Duration::from_millis(ms).min(MAX_COMMAND_TIMEOUT),
    }
}

/// Environment exported to the sandbox for one data source. Decrypts the
/// password, so every credential failure surfaces here, before any sandbox
/// is touched.
pub fn database_env(
    config: &DataSourceConfig,
    vault: &CredentialVault,
) -> Result<BTreeMap<String, String>, AdapterError> {
    let password = vault
        .decrypt_optional(config.encrypted_password())
        .map_err(|e| AdapterError::Decryption(e.to_string()))?;
    if config.requires_password() && password.is_none() {
        return Err(AdapterError::MissingCredential(config.engine_name()));
    }

    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };
    set("DB_TYPE", config.engine_name().to_string());
    if let Some(password) = &password {
        set("DB_PASSWORD", password.expose().to_string());
    }

    match config {
        DataSourceConfig::Postgres(c) => {
            set("DB_HOST", c.host.clone());
            set("DB_PORT", c.port.to_string());
            set("DB_NAME", c.database.clone());
            set("DB_USER", c.username.clone());
            set("DB_SSL_MODE", c.ssl_mode.as_str().to_string());
            if let Some(schema) = c.schema.clone().filter(|s| !s.is_empty()) {
                set("DB_SCHEMA", schema);
            }
        }
        DataSourceConfig::MySql(c) | DataSourceConfig::MariaDb(c) => {
            set("DB_HOST", c.host.clone());
            set("DB_PORT", c.port.to_string());
            set("DB_NAME", c.database.clone());
            set("DB_USER", c.username.clone());
            set("DB_SSL_MODE", c.ssl_mode.as_str().to_string());
        }
        DataSourceConfig::SqlServer(c) => {
            set("DB_HOST", c.host.clone());
            set("DB_PORT", c.port.to_string());
            set("DB_NAME", c.database.clone());
            set("DB_USER", c.username.clone());
            set("DB_SSL_MODE", c.ssl_mode.as_str().to_string());
        }
        DataSourceConfig::MongoDb(c) => {
            set("DB_HOST", c.host.clone());
            set("DB_PORT", c.port.to_string());
            set("DB_NAME", c.database.clone());
            set("DB_SSL_MODE", c.ssl_mode.as_str().to_string());
            if let Some(user) = c.username.clone().filter(|s| !s.is_empty()) {
                set("DB_USER", user);
            }
            if let Some(auth_db) = c.auth_database.clone().filter(|s| !s.is_empty()) {
                set("DB_AUTH_DB", auth_db);
            }
            if let Some(replica_set) = c.replica_set.clone().filter(|s| !s.is_empty()) {
                set("DB_REPLICA_SET", replica_set);
            }
        }
        DataSourceConfig::Sqlite(c) => {
            let path = c
                .file_path
                .clone()
                .filter(|p| !p.trim().is_empty())
                .ok_or(AdapterError::MissingFilePath)?;
            set("DB_FILE", path);
        }
        DataSourceConfig::Unsupported(raw) => {
            return Err(AdapterError::UnsupportedEngine(raw.engine_type().to_string()));
        }
    }
    Ok(env)
}

/// Reduce an artifact name to a single path component under `/docs`.
fn doc_path(filename: &str) -> Option<String> {
    let name = Path::new(filename).file_name()?.to_str()?;
    (!name.is_empty() && name != "..").then(|| format!("{DOCS_DIR}/{name}"))
}

pub struct CommandExecutor {
    pool: Arc<SandboxPool>,
    datasources: Arc<dyn DataSourceRepository>,
    vault: Arc<CredentialVault>,
}

impl CommandExecutor {
    pub fn new(
        pool: Arc<SandboxPool>,
        datasources: Arc<dyn DataSourceRepository>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            pool,
            datasources,
            vault,
        }
    }

    #[tracing::instrument(skip_all, fields(database_id = %request.database_id, owner_id = %owner_id))]
    pub async fn execute(&self, owner_id: &str, request: ExecuteRequest) -> ExecutionOutcome {
        let executed_at = Utc::now();
        let started = Instant::now();
        let finished = self.run(owner_id, &request).await;

        match finished.error_kind {
            Some(kind) => tracing::warn!(?kind, exit_code = finished.exit_code, "command failed"),
            None => tracing::info!(exit_code = finished.exit_code, "command finished"),
        }
        finished.into_outcome(started.elapsed(), executed_at)
    }

    async fn run(&self, owner_id: &str, request: &ExecuteRequest) -> Finished {
        let Some(datasource) = self
            .datasources
            .get_for_owner(owner_id, &request.database_id)
            .await
        else {
            return Finished::failed(
                ErrorKind::DataSourceNotFound,
                format!("database {} not found", request.database_id),
            );
        };

        let env = match database_env(&datasource.connection, &self.vault) {
            Ok(env) => env,
            Err(e) => return Finished::failed(e.kind(), e.to_string()),
        };
        let timeout = clamp_timeout(request.timeout_ms);

        let mut attempt = 1;
        loop {
            match self.attempt(&datasource, &env, request, timeout).await {
                Ok(finished) => return finished,
                Err(reason) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(attempt, reason = %reason, "sandbox stopped mid-command, retrying on a fresh one");
                    attempt += 1;
                }
                Err(reason) => {
                    return Finished::failed(
                        ErrorKind::SandboxStopped,
                        format!("sandbox stopped on every attempt: {reason}"),
                    );
                }
            }
        }
    }

    /// One try on one sandbox. `Err` means the sandbox died and the caller
    /// may retry; every other outcome is final.
    async fn attempt(
        &self,
        datasource: &DataSource,
        env: &BTreeMap<String, String>,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<Finished, String> {
        let lease = match self.pool.acquire(SANDBOX_RUNTIME, SANDBOX_LIFETIME).await {
            Ok(lease) => lease,
            Err(SandboxError::RateLimited(msg)) => {
                return Ok(Finished::failed(ErrorKind::RateLimited, format!("rate limited: {msg}")));
            }
            Err(e) => {
                return Ok(Finished::failed(
                    ErrorKind::SandboxUnavailable,
                    format!("could not acquire a sandbox: {e}"),
                ));
            }
        };
        tracing::debug!(sandbox_id = %lease.id(), pooled = lease.is_pooled(), "leased sandbox");

        let result = self.run_in(&lease, datasource, env, request, timeout).await;

        match result {
            Err(SandboxError::Stopped(reason)) => {
                self.pool.remove(lease.id()).await;
                Err(reason)
            }
            other => {
                self.return_lease(&lease).await;
                Ok(match other {
                    Ok(exec) => finished_from(exec, timeout),
                    Err(SandboxError::Timeout) => timed_out(String::new(), String::new(), timeout),
                    Err(SandboxError::RateLimited(msg)) => {
                        Finished::failed(ErrorKind::RateLimited, format!("rate limited: {msg}"))
                    }
                    Err(e) => Finished::failed(ErrorKind::SandboxUnavailable, e.to_string()),
                })
            }
        }
    }

    async fn run_in(
        &self,
        lease: &SandboxLease,
        datasource: &DataSource,
        env: &BTreeMap<String, String>,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecResult, SandboxError> {
        let handle = lease.handle();

        // Pooled sandboxes may carry another data source's docs.
        match handle.remove_path(DOCS_DIR, true).await {
            Ok(()) => {}
            Err(e) if e.is_stopped() => return Err(e),
            Err(e) => tracing::warn!(sandbox_id = %handle.id(), error = %e, "failed to clear docs directory"),
        }
        for doc in &datasource.documentation {
            let Some(path) = doc_path(&doc.filename) else {
                tracing::warn!(filename = %doc.filename, "skipping doc artifact with unusable filename");
                continue;
            };
            handle
                .put_file(PutFileRequest {
                    path,
                    bytes: doc.content.clone().into_bytes(),
                    create_parents: true,
                    mode: None,
                })
                .await?;
        }

        let mut exec = ExecRequest::shell(request.command.clone());
        exec.env = env.clone();
        exec.cwd = request.working_dir.clone().filter(|d| !d.is_empty());
        exec.timeout = Some(timeout);

        tokio::time::timeout(timeout + EXEC_GRACE, handle.exec(exec))
            .await
            .map_err(|_| SandboxError::Timeout)?
    }

    /// Pooled sandboxes go back to the idle set; overflow ones are stopped.
    async fn return_lease(&self, lease: &SandboxLease) {
        if lease.is_pooled() {
            self.pool.release(lease.id()).await;
        } else if let Err(e) = lease.handle().stop().await {
            tracing::warn!(sandbox_id = %lease.id(), error = %e, "failed to stop overflow sandbox");
        }
    }
}

fn timed_out(stdout: String, mut stderr: String, timeout: Duration) -> Finished {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&format!("command timed out after {}ms", timeout.as_millis()));
    Finished {
        exit_code: TIMEOUT_EXIT_CODE,
        stdout,
        stderr,
        error_kind: Some(ErrorKind::Timeout),
    }
}

fn finished_from(exec: ExecResult, timeout: Duration) -> Finished {
    let stdout = String::from_utf8_lossy(&exec.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&exec.stderr).into_owned();
    if exec.timed_out {
        return timed_out(stdout, stderr, timeout);
    }
    Finished {
        exit_code: exec.exit_code.unwrap_or(-1),
        stdout,
        stderr,
        error_kind: None,
    }
}
