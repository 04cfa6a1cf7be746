use serde::{Deserialize, Serialize};

/// Classification attached to every failed query, connection test, or
/// command execution. Serialized in PascalCase so clients can match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DataSourceNotFound,
    DecryptionFailure,
    MissingCredential,
    MissingFilePath,
    UnsupportedEngine,
    InvalidQuery,
    Timeout,
    SandboxStopped,
    SandboxUnavailable,
    RateLimited,
    DriverError,
}

impl ErrorKind {
    /// Short advice telling the caller whether to retry, reconfigure, or stop.
    pub fn hint(self) -> &'static str {
        match self {
            ErrorKind::DataSourceNotFound => "Check the database id; it does not belong to this account.",
            ErrorKind::DecryptionFailure => {
                "The stored credential could not be decrypted. Re-enter the password for this data source."
            }
            ErrorKind::MissingCredential => "This data source has no password configured. Add one and retry.",
            ErrorKind::MissingFilePath => "Configure the SQLite file path for this data source.",
            ErrorKind::UnsupportedEngine => "This database type is not supported.",
            ErrorKind::InvalidQuery => "Fix the query text and retry.",
            ErrorKind::Timeout => "The command exceeded its time limit. Narrow the query or raise the timeout (max 120s).",
            ErrorKind::SandboxStopped => "The execution sandbox stopped twice in a row. Retry later.",
            ErrorKind::SandboxUnavailable => "No execution sandbox could be started. Retry later.",
            ErrorKind::RateLimited => "The sandbox platform is rate limiting requests. Back off before retrying.",
            ErrorKind::DriverError => "The database reported an error; see the message for details.",
        }
    }
}
