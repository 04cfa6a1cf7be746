use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;

use crate::adapter::{self, AdapterError, QueryResult};
use crate::datasources::repository::DataSourceRepository;
use crate::datasources::{ConnectionTestResult, DataSource, DataSourceConfig, DocArtifact};
use crate::vault::CredentialVault;

/// Body of a create request. `password` is plaintext on the wire and is
/// encrypted before anything touches disk.
#[derive(Debug, Deserialize)]
pub struct NewDataSource {
    pub name: String,
    pub connection: DataSourceConfig,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub documentation: Vec<DocArtifact>,
}

/// Query and connection-test entry points. Owns decryption and timing so the
/// adapter stays a pure protocol layer.
pub struct DataSourceService {
    repo: Arc<dyn DataSourceRepository>,
    vault: Arc<CredentialVault>,
}

impl DataSourceService {
    pub fn new(repo: Arc<dyn DataSourceRepository>, vault: Arc<CredentialVault>) -> Self {
        Self { repo, vault }
    }

    pub fn repository(&self) -> &Arc<dyn DataSourceRepository> {
        &self.repo
    }

    pub async fn create(&self, owner_id: &str, request: NewDataSource) -> Result<DataSource> {
        let mut connection = request.connection;
        // Only ciphertext produced by this vault is ever persisted.
        connection.set_encrypted_password(None);
        if let Some(password) = request.password.filter(|p| !p.is_empty()) {
            let ciphertext = self
                .vault
                .encrypt(&password)
                .context("failed to encrypt datasource password")?;
            connection.set_encrypted_password(Some(ciphertext));
        }

        let now = Utc::now();
        let datasource = DataSource {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: request.name,
            connection,
            documentation: request.documentation,
            last_test: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.save(datasource.clone()).await?;
        tracing::info!(datasource_id = %datasource.id, engine = datasource.connection.engine_name(), "created datasource");
        Ok(datasource)
    }

    /// Run a query with latency and timestamp attached, success or not.
    #[tracing::instrument(skip_all, fields(datasource_id = %datasource.id, engine = datasource.connection.engine_name()))]
    pub async fn query(&self, datasource: &DataSource, query: &str) -> QueryResult {
        let executed_at = Utc::now();
        let started = Instant::now();

        let result = match self.vault.decrypt_optional(datasource.connection.encrypted_password()) {
            Ok(password) => adapter::execute(&datasource.connection, password.as_ref(), query).await,
            Err(e) => QueryResult::failure(&AdapterError::Decryption(e.to_string())),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(success = result.success, latency_ms, "query finished");
        result.with_timing(latency_ms, executed_at)
    }

    /// Test connectivity and write the outcome back onto the record.
    #[tracing::instrument(skip_all, fields(datasource_id = %datasource.id, engine = datasource.connection.engine_name()))]
    pub async fn test_connection(&self, datasource: &DataSource) -> ConnectionTestResult {
        let started = Instant::now();
        let outcome = adapter::test_connection(&datasource.connection, &self.vault).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(message) => ConnectionTestResult {
                success: true,
                message: Some(message),
                error: None,
                latency_ms,
                tested_at: Utc::now(),
            },
            Err(e) => {
                tracing::warn!(kind = ?e.kind(), error = %e, "connection test failed");
                ConnectionTestResult {
                    success: false,
                    message: None,
                    error: Some(e.to_string()),
                    latency_ms,
                    tested_at: Utc::now(),
                }
            }
        };

        if let Err(e) = self
            .repo
            .record_test(&datasource.owner_id, &datasource.id, result.clone())
            .await
        {
            tracing::error!(error = %e, "failed to persist connection test result");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::file_repository::FileDataSourceRepository;
    use crate::datasources::{PostgresConfig, SqliteConfig, SslMode};
    use crate::errors::ErrorKind;
    use crate::vault::test_vault;

    async fn service(tmp: &tempfile::TempDir) -> DataSourceService {
        let repo = FileDataSourceRepository::new(tmp.path());
        repo.load_all().await.unwrap();
        DataSourceService::new(Arc::new(repo), Arc::new(test_vault()))
    }

    fn sqlite_db(tmp: &tempfile::TempDir) -> String {
        let path = tmp.path().join("app.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn create_encrypts_password() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(&tmp).await;
        let ds = svc
            .create(
                "alice",
                NewDataSource {
                    name: "warehouse".into(),
                    connection: DataSourceConfig::Postgres(PostgresConfig {
                        host: "db".into(),
                        port: 5432,
                        database: "dw".into(),
                        username: "reader".into(),
                        schema: None,
                        ssl_mode: SslMode::Disable,
                        encrypted_password: None,
                    }),
                    password: Some("hunter2".into()),
                    documentation: vec![],
                },
            )
            .await
            .unwrap();

        let stored = ds.connection.encrypted_password().unwrap();
        assert_ne!(stored, "hunter2");
        assert_eq!(test_vault().decrypt(stored).unwrap().expose(), "hunter2");

        let on_disk = std::fs::read_to_string(tmp.path().join("datasources").join(format!("{}.json", ds.id))).unwrap();
        assert!(!on_disk.contains("hunter2"));
    }

    #[tokio::test]
    async fn create_ignores_client_supplied_ciphertext() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(&tmp).await;
        let ds = svc
            .create(
                "alice",
                NewDataSource {
                    name: "warehouse".into(),
                    connection: DataSourceConfig::Postgres(PostgresConfig {
                        host: "db".into(),
                        port: 5432,
                        database: "dw".into(),
                        username: "reader".into(),
                        schema: None,
                        ssl_mode: SslMode::Disable,
                        encrypted_password: Some("Zm9yZ2Vk".into()),
                    }),
                    password: None,
                    documentation: vec![],
                },
            )
            .await
            .unwrap();

        assert!(ds.connection.encrypted_password().is_none());
        let stored = svc.repository().get_for_owner("alice", &ds.id).await.unwrap();
        assert!(stored.connection.encrypted_password().is_none());
    }

    #[tokio::test]
    async fn query_attaches_timing() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(&tmp).await;
        let path = sqlite_db(&tmp);
        let ds = svc
            .create(
                "alice",
                NewDataSource {
                    name: "local".into(),
                    connection: DataSourceConfig::Sqlite(SqliteConfig { file_path: Some(path) }),
                    password: None,
                    documentation: vec![],
                },
            )
            .await
            .unwrap();

        let result = svc.query(&ds, "SELECT x FROM t").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.columns, vec!["x"]);
        assert!(result.latency_ms.is_some());
        assert!(result.executed_at.is_some());
    }

    #[tokio::test]
    async fn failed_query_still_has_timing() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(&tmp).await;
        let ds = svc
            .create(
                "alice",
                NewDataSource {
                    name: "broken".into(),
                    connection: DataSourceConfig::Sqlite(SqliteConfig { file_path: None }),
                    password: None,
                    documentation: vec![],
                },
            )
            .await
            .unwrap();

        let result = svc.query(&ds, "SELECT 1").await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::MissingFilePath));
        assert!(result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn corrupt_ciphertext_is_decryption_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(&tmp).await;
        let mut ds = crate::datasources::file_repository::sample_datasource(
            "ds-1",
            "alice",
            DataSourceConfig::Postgres(PostgresConfig {
                host: "db".into(),
                port: 5432,
                database: "dw".into(),
                username: "reader".into(),
                schema: None,
                ssl_mode: SslMode::Disable,
                encrypted_password: None,
            }),
        );
        ds.connection.set_encrypted_password(Some("AAAA".into()));

        let result = svc.query(&ds, "SELECT 1").await;
        assert_eq!(result.error_kind, Some(ErrorKind::DecryptionFailure));
    }

    #[tokio::test]
    async fn test_connection_writes_back_last_test() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(&tmp).await;
        let path = sqlite_db(&tmp);
        let ds = svc
            .create(
                "alice",
                NewDataSource {
                    name: "local".into(),
                    connection: DataSourceConfig::Sqlite(SqliteConfig { file_path: Some(path) }),
                    password: None,
                    documentation: vec![],
                },
            )
            .await
            .unwrap();

        let result = svc.test_connection(&ds).await;
        assert!(result.success, "{:?}", result.error);

        let stored = svc.repository().get_for_owner("alice", &ds.id).await.unwrap();
        let last = stored.last_test.unwrap();
        assert!(last.success);
        assert_eq!(last.message.as_deref(), Some("Successfully connected to sqlite"));
    }

    #[tokio::test]
    async fn failed_test_records_error() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(&tmp).await;
        let ds = svc
            .create(
                "alice",
                NewDataSource {
                    name: "nopath".into(),
                    connection: DataSourceConfig::Sqlite(SqliteConfig { file_path: None }),
                    password: None,
                    documentation: vec![],
                },
            )
            .await
            .unwrap();

        let result = svc.test_connection(&ds).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("File path is required for SQLite"));
        let stored = svc.repository().get_for_owner("alice", &ds.id).await.unwrap();
        assert!(!stored.last_test.unwrap().success);
    }
}
