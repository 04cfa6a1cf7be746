//! In-memory sandbox provider for pool and executor tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::provider::SandboxProvider;
use super::types::*;

/// Scripted outcome for the next `exec` call on any fake sandbox.
#[derive(Debug, Clone)]
pub enum FakeExec {
    Output { exit_code: i32, stdout: String, stderr: String },
    TimedOut,
    Stopped,
    RateLimited,
    /// Sleep before answering, to trip the caller's own deadline.
    Hang(Duration),
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<FakeExec>>,
    execs: Mutex<Vec<(String, ExecRequest)>>,
    files: Mutex<Vec<(String, String, Vec<u8>)>>,
    removed: Mutex<Vec<(String, String)>>,
    stopped: Mutex<Vec<String>>,
    stop_attempts: AtomicUsize,
    fail_stop: AtomicBool,
}

#[derive(Default)]
pub struct FakeProvider {
    shared: Arc<Shared>,
    provisioned: AtomicUsize,
    fail_provision: AtomicBool,
    provision_delay: Mutex<Option<Duration>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exec(&self, outcome: FakeExec) {
        self.shared.script.lock().unwrap().push_back(outcome);
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        *self.provision_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_provisions(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.shared.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// (sandbox id, request) for every exec issued.
    pub fn execs(&self) -> Vec<(String, ExecRequest)> {
        self.shared.execs.lock().unwrap().clone()
    }

    /// (sandbox id, path, bytes) for every file written.
    pub fn files(&self) -> Vec<(String, String, Vec<u8>)> {
        self.shared.files.lock().unwrap().clone()
    }

    pub fn removed_paths(&self) -> Vec<(String, String)> {
        self.shared.removed.lock().unwrap().clone()
    }

    pub fn stopped_ids(&self) -> Vec<String> {
        self.shared.stopped.lock().unwrap().clone()
    }

    pub fn stop_attempts(&self) -> usize {
        self.shared.stop_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            kind: SandboxBackendKind::Remote,
            runtime: "fake".into(),
            network_isolated: true,
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let delay = *self.provision_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(SandboxError::Provision("fake provider refused".into()));
        }
        let seq = self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeHandle {
            id: format!("fake-{seq}"),
            metadata: SandboxMetadata::from_spec(&spec),
            shared: self.shared.clone(),
        }))
    }
}

struct FakeHandle {
    id: String,
    metadata: SandboxMetadata,
    shared: Arc<Shared>,
}

#[async_trait]
impl SandboxHandle for FakeHandle {
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
        self.shared.execs.lock().unwrap().push((self.id.clone(), req));
        let next = self.shared.script.lock().unwrap().pop_front();
        let result = |exit_code: Option<i32>, stdout: String, stderr: String, timed_out: bool| ExecResult {
            exit_code,
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            timed_out,
        };
        match next {
            None => Ok(result(Some(0), String::new(), String::new(), false)),
            Some(FakeExec::Output { exit_code, stdout, stderr }) => {
                Ok(result(Some(exit_code), stdout, stderr, false))
            }
            Some(FakeExec::TimedOut) => Ok(result(None, String::new(), String::new(), true)),
            Some(FakeExec::Stopped) => Err(SandboxError::Stopped(format!("{} is stopped", self.id))),
            Some(FakeExec::RateLimited) => Err(SandboxError::RateLimited("429".into())),
            Some(FakeExec::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(result(Some(0), String::new(), String::new(), false))
            }
        }
    }

    async fn put_file(&self, req: PutFileRequest) -> Result<(), SandboxError> {
        self.shared
            .files
            .lock()
            .unwrap()
            .push((self.id.clone(), req.path, req.bytes));
        Ok(())
    }

    async fn remove_path(&self, path: &str, _recursive: bool) -> Result<(), SandboxError> {
        self.shared
            .removed
            .lock()
            .unwrap()
            .push((self.id.clone(), path.to_string()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.shared.stop_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_stop.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend("fake stop failure".into()));
        }
        self.shared.stopped.lock().unwrap().push(self.id.clone());
        Ok(())
    }
}
