//! Uniform "run a query, get rows + columns" contract over every supported
//! engine. One connection per call, closed on every exit path.
//!
//! Engine modules return a bare [`QueryOutput`]; latency and timestamp are
//! attached by the caller (see `service.rs`).

pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod sqlserver;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datasources::{DataSourceConfig, UnsupportedConfig};
use crate::errors::ErrorKind;
use crate::vault::{CredentialVault, Plaintext};

pub const TEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const EXECUTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const REDACTED: &str = "****";

pub type Row = serde_json::Map<String, Value>;

#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("Password is required for {0}")]
    MissingCredential(&'static str),

    #[error("File path is required for SQLite")]
    MissingFilePath,

    #[error("Unsupported database engine: {0}")]
    UnsupportedEngine(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("connection timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Driver(String),

    #[error("failed to decrypt stored credential: {0}")]
    Decryption(String),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::MissingCredential(_) => ErrorKind::MissingCredential,
            AdapterError::MissingFilePath => ErrorKind::MissingFilePath,
            AdapterError::UnsupportedEngine(_) => ErrorKind::UnsupportedEngine,
            AdapterError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Driver(_) => ErrorKind::DriverError,
            AdapterError::Decryption(_) => ErrorKind::DecryptionFailure,
        }
    }

    pub(crate) fn driver(e: impl std::fmt::Display) -> Self {
        AdapterError::Driver(e.to_string())
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        AdapterError::Timeout(after.as_secs())
    }

    /// Scrub the plaintext password out of any driver-supplied text.
    pub fn redact(self, secret: Option<&Plaintext>) -> Self {
        let Some(secret) = secret.filter(|s| !s.is_empty()) else {
            return self;
        };
        let scrub = |msg: String| msg.replace(secret.expose(), REDACTED);
        match self {
            AdapterError::Driver(msg) => AdapterError::Driver(scrub(msg)),
            AdapterError::InvalidQuery(msg) => AdapterError::InvalidQuery(scrub(msg)),
            other => other,
        }
    }
}

/// Normalized output of one statement, before timing is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl QueryResult {
    pub fn from_output(output: QueryOutput) -> Self {
        Self {
            success: true,
            rows: output.rows,
            columns: output.columns,
            error: None,
            error_kind: None,
            latency_ms: None,
            executed_at: None,
        }
    }

    pub fn failure(error: &AdapterError) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            columns: Vec::new(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            latency_ms: None,
            executed_at: None,
        }
    }

    pub fn with_timing(mut self, latency_ms: u64, executed_at: DateTime<Utc>) -> Self {
        self.latency_ms = Some(latency_ms);
        self.executed_at = Some(executed_at);
        self
    }
}

fn require_password<'a>(
    config: &DataSourceConfig,
    password: Option<&'a Plaintext>,
) -> Result<&'a Plaintext, AdapterError> {
    password
        .filter(|p| !p.is_empty())
        .ok_or(AdapterError::MissingCredential(config.engine_name()))
}

fn unsupported(raw: &UnsupportedConfig) -> AdapterError {
    AdapterError::UnsupportedEngine(raw.engine_type().to_string())
}

/// Run `query` against the data source. Failures come back as
/// `success: false` results, never as errors.
pub async fn execute(config: &DataSourceConfig, password: Option<&Plaintext>, query: &str) -> QueryResult {
    match run(config, password, query).await {
        Ok(output) => QueryResult::from_output(output),
        Err(e) => {
            let e = e.redact(password);
            tracing::warn!(engine = config.engine_name(), kind = ?e.kind(), error = %e, "query failed");
            QueryResult::failure(&e)
        }
    }
}

async fn run(config: &DataSourceConfig, password: Option<&Plaintext>, query: &str) -> Result<QueryOutput, AdapterError> {
    let timeout = EXECUTE_CONNECT_TIMEOUT;
    match config {
        DataSourceConfig::Postgres(c) => postgres::execute(c, require_password(config, password)?, query, timeout).await,
        DataSourceConfig::MySql(c) | DataSourceConfig::MariaDb(c) => {
            mysql::execute(c, require_password(config, password)?, query, timeout).await
        }
        DataSourceConfig::SqlServer(c) => {
            sqlserver::execute(c, require_password(config, password)?, query, timeout).await
        }
        DataSourceConfig::MongoDb(c) => mongo::execute(c, password, query, timeout).await,
        DataSourceConfig::Sqlite(c) => sqlite::execute(c, query).await,
        DataSourceConfig::Unsupported(raw) => Err(unsupported(raw)),
    }
}

/// Open a connection and run a trivial round trip. Decrypts the stored
/// password itself; returns a human-readable success message.
pub async fn test_connection(config: &DataSourceConfig, vault: &CredentialVault) -> Result<String, AdapterError> {
    if let DataSourceConfig::Unsupported(raw) = config {
        return Err(unsupported(raw));
    }
    let password = vault
        .decrypt_optional(config.encrypted_password())
        .map_err(|e| AdapterError::Decryption(e.to_string()))?;
    let password = password.as_ref();
    let timeout = TEST_CONNECT_TIMEOUT;

    let result = match config {
        DataSourceConfig::Postgres(c) => postgres::ping(c, require_password(config, password)?, timeout).await,
        DataSourceConfig::MySql(c) | DataSourceConfig::MariaDb(c) => {
            mysql::ping(c, require_password(config, password)?, timeout).await
        }
        DataSourceConfig::SqlServer(c) => sqlserver::ping(c, require_password(config, password)?, timeout).await,
        DataSourceConfig::MongoDb(c) => mongo::ping(c, password, timeout).await,
        DataSourceConfig::Sqlite(c) => sqlite::ping(c).await,
        DataSourceConfig::Unsupported(raw) => Err(unsupported(raw)),
    };

    result
        .map(|()| format!("Successfully connected to {}", config.engine_name()))
        .map_err(|e| e.redact(password))
}

/// JSON number from a float, or `null` for NaN / infinity.
pub(crate) fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::{MySqlConfig, PostgresConfig, SqliteConfig, SslMode};
    use crate::vault::test_vault;

    fn postgres(encrypted_password: Option<String>) -> DataSourceConfig {
        DataSourceConfig::Postgres(PostgresConfig {
            host: "127.0.0.1".into(),
            port: 1,
            database: "app".into(),
            username: "reader".into(),
            schema: None,
            ssl_mode: SslMode::Disable,
            encrypted_password,
        })
    }

    #[test]
    fn redact_scrubs_password_from_driver_text() {
        let vault = test_vault();
        let secret = vault.decrypt(&vault.encrypt("s3cr3t").unwrap()).unwrap();
        let err = AdapterError::Driver("auth failed for password s3cr3t".into()).redact(Some(&secret));
        assert_eq!(err.to_string(), "auth failed for password ****");
    }

    #[test]
    fn redact_leaves_other_variants_alone() {
        let vault = test_vault();
        let secret = vault.decrypt(&vault.encrypt("x").unwrap()).unwrap();
        let err = AdapterError::MissingFilePath.redact(Some(&secret));
        assert_eq!(err.to_string(), "File path is required for SQLite");
    }

    #[test]
    fn failure_result_carries_kind() {
        let result = QueryResult::failure(&AdapterError::Timeout(30));
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.rows.is_empty());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error_kind"], "Timeout");
        assert!(json.get("latency_ms").is_none());
    }

    #[tokio::test]
    async fn missing_password_rejected_before_connecting() {
        let result = execute(&postgres(None), None, "SELECT 1").await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::MissingCredential));
        assert_eq!(result.error.as_deref(), Some("Password is required for postgresql"));
    }

    #[tokio::test]
    async fn empty_stored_password_is_missing_credential() {
        let vault = test_vault();
        let config = postgres(Some(vault.encrypt("").unwrap()));
        let err = test_connection(&config, &vault).await.unwrap_err();
        assert!(matches!(err, AdapterError::MissingCredential("postgresql")));
    }

    #[tokio::test]
    async fn undecryptable_password_is_decryption_failure() {
        let vault = test_vault();
        let config = DataSourceConfig::MySql(MySqlConfig {
            host: "127.0.0.1".into(),
            port: 1,
            database: "d".into(),
            username: "u".into(),
            ssl_mode: SslMode::Disable,
            encrypted_password: Some("garbage".into()),
        });
        let err = test_connection(&config, &vault).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailure);
    }

    #[tokio::test]
    async fn unsupported_engine_reports_explicitly() {
        let config: DataSourceConfig =
            serde_json::from_value(serde_json::json!({ "engine_type": "oracle", "host": "legacy" })).unwrap();
        let result = execute(&config, None, "SELECT 1").await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::UnsupportedEngine));
        assert_eq!(result.error.as_deref(), Some("Unsupported database engine: oracle"));
    }

    #[tokio::test]
    async fn sqlite_without_path_fails_fast() {
        let vault = test_vault();
        let config = DataSourceConfig::Sqlite(SqliteConfig { file_path: None });
        let err = test_connection(&config, &vault).await.unwrap_err();
        assert_eq!(err.to_string(), "File path is required for SQLite");
        assert_eq!(err.kind(), ErrorKind::MissingFilePath);
    }

    #[test]
    fn float_value_handles_nan() {
        assert_eq!(float_value(f64::NAN), Value::Null);
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
    }
}
