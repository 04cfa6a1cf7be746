//! Remote sandbox backend.
//!
//! Talks to a hosted sandbox API over HTTP. The platform owns the
//! microVM lifecycle; dbrelay only creates sandboxes, runs commands in
//! them, writes files, and stops them.
//!
//! API: POST /sandboxes, POST /sandboxes/{id}/exec, PUT /sandboxes/{id}/files,
//! DELETE /sandboxes/{id}/files, POST /sandboxes/{id}/stop

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::types::*;

/// Extra time granted to the HTTP round-trip on top of the command budget.
const EXEC_HTTP_GRACE: Duration = Duration::from_secs(10);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateSandboxBody<'a> {
    runtime: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct SandboxResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct ExecBody<'a> {
    cmd: &'a str,
    args: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    env: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: Option<i32>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    timed_out: bool,
}

#[derive(Debug, Serialize)]
struct PutFileBody<'a> {
    path: &'a str,
    content_base64: String,
    create_parents: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP client for the sandbox platform REST API.
#[derive(Debug, Clone)]
pub struct RemoteSandboxClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RemoteSandboxClient {
    pub fn new(config: &RemoteSandboxConfig) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SandboxError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, op: &str) -> Result<reqwest::Response, SandboxError> {
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SandboxError::Timeout
            } else {
                SandboxError::Backend(format!("sandbox API {op} failed: {e}"))
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &body, op))
    }

    pub async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let body = CreateSandboxBody {
            runtime: &spec.runtime,
            timeout_ms: spec.timeout.as_millis() as u64,
        };
        let resp = self
            .send(self.request(reqwest::Method::POST, "/sandboxes").json(&body), "create")
            .await
            .map_err(|e| match e {
                SandboxError::Backend(msg) => SandboxError::Provision(msg),
                other => other,
            })?;
        let created = resp
            .json::<SandboxResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse sandbox response: {e}")))?;
        Ok(created.id)
    }

    pub async fn exec(&self, id: &str, req: &ExecRequest) -> Result<ExecResult, SandboxError> {
        let Some((cmd, args)) = req.command.split_first() else {
            return Err(SandboxError::Exec("empty command".into()));
        };
        let body = ExecBody {
            cmd,
            args,
            cwd: req.cwd.as_deref(),
            env: &req.env,
            timeout_ms: req.timeout.map(|t| t.as_millis() as u64),
        };

        let mut builder = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{id}/exec"))
            .json(&body);
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout + EXEC_HTTP_GRACE);
        }
        let resp = self.send(builder, "exec").await?;
        let out = resp
            .json::<ExecResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse exec response: {e}")))?;

        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout: out.stdout.into_bytes(),
            stderr: out.stderr.into_bytes(),
            timed_out: out.timed_out,
        })
    }

    pub async fn put_file(&self, id: &str, req: &PutFileRequest) -> Result<(), SandboxError> {
        let body = PutFileBody {
            path: &req.path,
            content_base64: BASE64.encode(&req.bytes),
            create_parents: req.create_parents,
            mode: req.mode,
        };
        self.send(
            self.request(reqwest::Method::PUT, &format!("/sandboxes/{id}/files")).json(&body),
            "put_file",
        )
        .await?;
        Ok(())
    }

    pub async fn remove_path(&self, id: &str, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let recursive = if recursive { "true" } else { "false" };
        let builder = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{id}/files"))
            .query(&[("path", path), ("recursive", recursive)]);
        self.send(builder, "remove_path").await?;
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<(), SandboxError> {
        match self
            .send(self.request(reqwest::Method::POST, &format!("/sandboxes/{id}/stop")), "stop")
            .await
        {
            Ok(_) => Ok(()),
            // already gone is the state we wanted
            Err(SandboxError::Stopped(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Map a non-2xx platform response onto a sandbox error.
///
/// 429 is a rate limit; 404/410 or a body mentioning a stopped sandbox
/// means the sandbox is dead.
fn classify_failure(status: StatusCode, body: &str, op: &str) -> SandboxError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return SandboxError::RateLimited(format!("sandbox API {op} returned {status}"));
    }
    let lowered = body.to_ascii_lowercase();
    if status == StatusCode::NOT_FOUND
        || status == StatusCode::GONE
        || lowered.contains("sandbox_stopped")
        || lowered.contains("stopped")
    {
        return SandboxError::Stopped(format!("sandbox API {op} returned {status}: {body}"));
    }
    SandboxError::Backend(format!("sandbox API {op} returned {status}: {body}"))
}

// ── Provider ────────────────────────────────────────────────────────

pub struct RemoteSandboxProvider {
    client: RemoteSandboxClient,
}

impl RemoteSandboxProvider {
    pub fn new(config: RemoteSandboxConfig) -> Result<Self, SandboxError> {
        Ok(Self {
            client: RemoteSandboxClient::new(&config)?,
        })
    }
}

#[async_trait]
impl SandboxProvider for RemoteSandboxProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            kind: SandboxBackendKind::Remote,
            runtime: "remote".into(),
            network_isolated: true,
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let id = self.client.create(&spec).await?;
        tracing::info!(sandbox_id = %id, runtime = %spec.runtime, "remote sandbox created");
        Ok(Arc::new(RemoteHandle {
            id,
            client: self.client.clone(),
            metadata: SandboxMetadata::from_spec(&spec),
        }))
    }
}

struct RemoteHandle {
    id: String,
    client: RemoteSandboxClient,
    metadata: SandboxMetadata,
}

#[async_trait]
impl SandboxHandle for RemoteHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Remote
    }

    fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        self.client.exec(&self.id, &req).await
    }

    async fn put_file(&self, req: PutFileRequest) -> Result<(), SandboxError> {
        self.client.put_file(&self.id, &req).await
    }

    async fn remove_path(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        self.client.remove_path(&self.id, path, recursive).await
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        tracing::info!(sandbox_id = %self.id, "stopping remote sandbox");
        self.client.stop(&self.id).await
    }
}
