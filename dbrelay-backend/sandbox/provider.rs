use std::sync::Arc;

use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::{SandboxProviderInfo, SandboxSpec};

/// Factory for creating sandboxes.
///
/// One provider instance lives behind the sandbox pool. Each call to
/// `provision()` creates a new isolated sandbox; reuse is the pool's job.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Metadata about this provider (backend kind, runtime).
    fn info(&self) -> SandboxProviderInfo;

    /// Create a new sandbox from the given spec.
    async fn provision(&self, spec: SandboxSpec) -> Result<Arc<dyn SandboxHandle>, SandboxError>;
}
