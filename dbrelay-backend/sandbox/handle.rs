use async_trait::async_trait;

use super::error::SandboxError;
use super::types::*;

/// Handle to a running sandbox. Everything the command executor needs.
///
/// Handles are shared as `Arc<dyn SandboxHandle>` between the pool and the
/// caller currently leasing them, so every operation takes `&self`.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;
    fn backend_kind(&self) -> SandboxBackendKind;
    fn metadata(&self) -> &SandboxMetadata;

    // ── Exec ────────────────────────────────────────────────────

    /// Run a command to completion, capturing stdout/stderr.
    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError>;

    // ── Files ───────────────────────────────────────────────────

    async fn put_file(&self, req: PutFileRequest) -> Result<(), SandboxError>;
    async fn remove_path(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    // ── Lifecycle ───────────────────────────────────────────────

    async fn stop(&self) -> Result<(), SandboxError>;
}
