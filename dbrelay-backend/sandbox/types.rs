use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SandboxBackendKind {
    LocalHost,
    Remote,
}

// ── Provider info ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SandboxProviderInfo {
    pub kind: SandboxBackendKind,
    pub runtime: String,
    pub network_isolated: bool,
}

// ── Sandbox spec (input to provision) ───────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Fixed identifier of the execution runtime (e.g. "node22").
    pub runtime: String,
    /// Lifetime budget the platform grants the sandbox.
    pub timeout: Duration,
}

impl SandboxSpec {
    pub fn new(runtime: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runtime: runtime.into(),
            timeout,
        }
    }
}

// ── Metadata ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxMetadata {
    pub runtime: String,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
}

impl SandboxMetadata {
    pub fn from_spec(spec: &SandboxSpec) -> Self {
        Self {
            runtime: spec.runtime.clone(),
            timeout: spec.timeout,
            created_at: Utc::now(),
        }
    }

    /// When the platform will reclaim the sandbox regardless of use.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|lifetime| self.created_at.checked_add_signed(lifetime))
    }
}

// ── Exec model ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// Run `script` through the sandbox's login shell.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            command: vec!["bash".into(), "-lc".into(), script.into()],
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

// ── File operations ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PutFileRequest {
    pub path: String,
    pub bytes: Vec<u8>,
    pub create_parents: bool,
    pub mode: Option<u32>,
}

// ── Backend configs ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalHostConfig {
    pub root_dir: PathBuf,
    pub inherit_env_allowlist: Vec<String>,
    pub max_output_bytes: usize,
}

impl Default for LocalHostConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(""), // must be set by caller
            inherit_env_allowlist: vec!["PATH".into(), "HOME".into(), "LANG".into(), "TERM".into()],
            max_output_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSandboxConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

/// Which backend the server builds at startup.
#[derive(Debug, Clone)]
pub enum SandboxRuntimeConfig {
    LocalHost(LocalHostConfig),
    Remote(RemoteSandboxConfig),
}
