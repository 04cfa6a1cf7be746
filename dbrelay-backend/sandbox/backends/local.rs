use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_supervisor::ProcessSupervisor;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::types::*;

/// Host-process sandbox provider.
///
/// Each sandbox gets its own workspace directory under `config.root_dir`;
/// guest paths such as `/docs/<file>` resolve inside it. Processes run as
/// the current user with a filtered env.
/// NOT a security boundary; meant for development and trusted hosts.
pub struct LocalHostProvider {
    config: LocalHostConfig,
    counter: AtomicU64,
}

impl LocalHostProvider {
    pub fn new(config: LocalHostConfig) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&config.root_dir).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create sandboxes root {}: {e}",
                config.root_dir.display()
            ))
        })?;
        Ok(Self {
            config,
            counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl SandboxProvider for LocalHostProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            kind: SandboxBackendKind::LocalHost,
            runtime: "host".into(),
            network_isolated: false,
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let short = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let sandbox_id = format!("local-{short}-{seq}");
        let workspace_dir = self.config.root_dir.join(&sandbox_id);

        tracing::info!(
            sandbox_id = %sandbox_id,
            runtime = %spec.runtime,
            workspace_dir = %workspace_dir.display(),
            "provisioning local sandbox"
        );

        let jail = FsJail::create(workspace_dir)?;
        let supervisor = ProcessSupervisor::new(
            self.config.inherit_env_allowlist.clone(),
            self.config.max_output_bytes,
        );

        Ok(Arc::new(LocalHandle {
            id: sandbox_id,
            jail,
            supervisor,
            metadata: SandboxMetadata::from_spec(&spec),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct LocalHandle {
    id: String,
    jail: FsJail,
    supervisor: ProcessSupervisor,
    metadata: SandboxMetadata,
    stopped: AtomicBool,
}

impl LocalHandle {
    /// A sandbox whose workspace vanished is as dead as a stopped one.
    fn ensure_running(&self) -> Result<(), SandboxError> {
        if self.stopped.load(Ordering::SeqCst) || !self.jail.is_alive() {
            return Err(SandboxError::Stopped(format!("sandbox {} is not running", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for LocalHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::LocalHost
    }

    fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        self.ensure_running()?;
        tracing::debug!(
            sandbox_id = %self.id,
            program = ?req.command.first(),
            "executing command in local sandbox"
        );

        let working_dir = match req.cwd.as_deref() {
            Some(cwd) => {
                let dir = self.jail.resolve(cwd)?;
                std::fs::create_dir_all(&dir)?;
                dir
            }
            None => self.jail.resolve("/")?,
        };
        self.supervisor.exec(&req, &working_dir).await
    }

    async fn put_file(&self, req: PutFileRequest) -> Result<(), SandboxError> {
        self.ensure_running()?;
        self.jail.put_file(&req)
    }

    async fn remove_path(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        self.ensure_running()?;
        self.jail.remove_path(path, recursive)
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(sandbox_id = %self.id, "stopping local sandbox");
        self.jail.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_provider() -> (tempfile::TempDir, LocalHostProvider) {
        let tmp = tempfile::tempdir().unwrap();
        let config = LocalHostConfig {
            root_dir: tmp.path().join("sandboxes"),
            ..LocalHostConfig::default()
        };
        let provider = LocalHostProvider::new(config).unwrap();
        (tmp, provider)
    }

    fn spec() -> SandboxSpec {
        SandboxSpec::new("node22", Duration::from_secs(300))
    }

    #[tokio::test]
    async fn provision_and_exec() {
        let (_tmp, provider) = test_provider();
        let handle = provider.provision(spec()).await.unwrap();

        assert!(handle.id().starts_with("local-"));
        assert_eq!(handle.backend_kind(), SandboxBackendKind::LocalHost);
        assert_eq!(handle.metadata().runtime, "node22");

        let mut req = ExecRequest::shell("echo \"$DB_TYPE\"");
        req.env.insert("DB_TYPE".into(), "postgresql".into());
        req.timeout = Some(Duration::from_secs(5));
        let result = handle.exec(req).await.unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "postgresql");
    }

    #[tokio::test]
    async fn docs_are_readable_from_working_dir() {
        let (_tmp, provider) = test_provider();
        let handle = provider.provision(spec()).await.unwrap();

        handle
            .put_file(PutFileRequest {
                path: "/docs/schema.md".into(),
                bytes: b"users(id, email)".to_vec(),
                create_parents: true,
                mode: None,
            })
            .await
            .unwrap();

        let mut req = ExecRequest::shell("cat ../docs/schema.md");
        req.cwd = Some("/work".into());
        req.timeout = Some(Duration::from_secs(5));
        let result = handle.exec(req).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&result.stdout), "users(id, email)");
    }

    #[tokio::test]
    async fn exec_after_stop_reports_stopped() {
        let (_tmp, provider) = test_provider();
        let handle = provider.provision(spec()).await.unwrap();

        handle.stop().await.unwrap();
        // second stop is a no-op
        handle.stop().await.unwrap();

        let err = handle.exec(ExecRequest::shell("true")).await.unwrap_err();
        assert!(err.is_stopped());
    }

    #[tokio::test]
    async fn sandboxes_get_distinct_workspaces() {
        let (_tmp, provider) = test_provider();
        let a = provider.provision(spec()).await.unwrap();
        let b = provider.provision(spec()).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn provider_info() {
        let (_tmp, provider) = test_provider();
        let info = provider.info();
        assert_eq!(info.kind, SandboxBackendKind::LocalHost);
        assert!(!info.network_isolated);
    }
}
