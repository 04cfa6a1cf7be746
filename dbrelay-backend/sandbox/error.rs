use std::io;

/// Errors from sandbox operations.
///
/// Backends map their internal errors into these variants. `Stopped` and
/// `RateLimited` are the two conditions the command executor classifies
/// separately: a stopped sandbox is dropped from the pool and retried once,
/// a rate-limited platform is reported back to the caller untouched.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("provision failed: {0}")]
    Provision(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("sandbox stopped: {0}")]
    Stopped(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timeout")]
    Timeout,

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// True when the platform reports the sandbox as gone.
    pub fn is_stopped(&self) -> bool {
        matches!(self, SandboxError::Stopped(_))
    }
}
