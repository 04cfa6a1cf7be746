pub mod backends;
pub mod error;
pub mod handle;
pub mod local_host;
pub mod pool;
pub mod provider;
pub mod types;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

pub use error::SandboxError;
pub use handle::SandboxHandle;
pub use pool::{PoolConfig, SandboxLease, SandboxPool};
pub use provider::SandboxProvider;
pub use types::*;

use backends::local::LocalHostProvider;
use backends::remote::RemoteSandboxProvider;

/// Build a sandbox provider from runtime config.
pub fn build_provider(config: SandboxRuntimeConfig) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
    match config {
        SandboxRuntimeConfig::LocalHost(c) => {
            tracing::info!(
                root_dir = %c.root_dir.display(),
                "initializing local-host sandbox provider"
            );
            Ok(Arc::new(LocalHostProvider::new(c)?))
        }
        SandboxRuntimeConfig::Remote(c) => {
            tracing::info!(api_url = %c.api_base_url, "initializing remote sandbox provider");
            Ok(Arc::new(RemoteSandboxProvider::new(c)?))
        }
    }
}
