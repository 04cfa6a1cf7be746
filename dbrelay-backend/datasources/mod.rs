pub mod file_repository;
pub mod repository;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// TLS policy for a connection. `Require` encrypts but accepts any
/// certificate; the `Verify*` modes validate the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn is_enabled(self) -> bool {
        self != SslMode::Disable
    }

    pub fn accepts_invalid_certs(self) -> bool {
        self == SslMode::Require
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_sqlserver_port() -> u16 {
    1433
}

fn default_mongo_port() -> u16 {
    27017
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
}

/// Shared by MySQL and MariaDB; both speak the same protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlServerConfig {
    pub host: String,
    #[serde(default = "default_sqlserver_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_mongo_port")]
    pub port: u16,
    pub database: String,
    /// Full `mongodb://` / `mongodb+srv://` URI; takes precedence over host/port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<String>,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqliteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Connection settings, one variant per engine.
///
/// Serialized internally tagged by `engine_type`. Records whose tag this
/// build does not know load as [`DataSourceConfig::Unsupported`] and keep
/// their fields, so writing them back loses nothing.
#[derive(Debug, Clone)]
pub enum DataSourceConfig {
    Postgres(PostgresConfig),
    MySql(MySqlConfig),
    MariaDb(MySqlConfig),
    SqlServer(SqlServerConfig),
    MongoDb(MongoConfig),
    Sqlite(SqliteConfig),
    Unsupported(UnsupportedConfig),
}

/// Raw fields of a record with an unknown `engine_type`, tag included.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsupportedConfig {
    fields: Map<String, Value>,
}

impl UnsupportedConfig {
    pub fn engine_type(&self) -> &str {
        self.fields
            .get(ENGINE_TAG)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }
}

const ENGINE_TAG: &str = "engine_type";

#[derive(Deserialize)]
#[serde(tag = "engine_type")]
enum KnownEngine {
    #[serde(rename = "postgresql")]
    Postgres(PostgresConfig),
    #[serde(rename = "mysql")]
    MySql(MySqlConfig),
    #[serde(rename = "mariadb")]
    MariaDb(MySqlConfig),
    #[serde(rename = "sqlserver")]
    SqlServer(SqlServerConfig),
    #[serde(rename = "mongodb")]
    MongoDb(MongoConfig),
    #[serde(rename = "sqlite")]
    Sqlite(SqliteConfig),
}

#[derive(Serialize)]
#[serde(tag = "engine_type")]
enum KnownEngineRef<'a> {
    #[serde(rename = "postgresql")]
    Postgres(&'a PostgresConfig),
    #[serde(rename = "mysql")]
    MySql(&'a MySqlConfig),
    #[serde(rename = "mariadb")]
    MariaDb(&'a MySqlConfig),
    #[serde(rename = "sqlserver")]
    SqlServer(&'a SqlServerConfig),
    #[serde(rename = "mongodb")]
    MongoDb(&'a MongoConfig),
    #[serde(rename = "sqlite")]
    Sqlite(&'a SqliteConfig),
}

const KNOWN_ENGINES: &[&str] = &["postgresql", "mysql", "mariadb", "sqlserver", "mongodb", "sqlite"];

impl Serialize for DataSourceConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let known = match self {
            DataSourceConfig::Postgres(c) => KnownEngineRef::Postgres(c),
            DataSourceConfig::MySql(c) => KnownEngineRef::MySql(c),
            DataSourceConfig::MariaDb(c) => KnownEngineRef::MariaDb(c),
            DataSourceConfig::SqlServer(c) => KnownEngineRef::SqlServer(c),
            DataSourceConfig::MongoDb(c) => KnownEngineRef::MongoDb(c),
            DataSourceConfig::Sqlite(c) => KnownEngineRef::Sqlite(c),
            DataSourceConfig::Unsupported(raw) => return raw.fields.serialize(serializer),
        };
        known.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataSourceConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::<String, Value>::deserialize(deserializer)?;
        let Some(engine) = fields.get(ENGINE_TAG).and_then(Value::as_str) else {
            return Err(de::Error::missing_field(ENGINE_TAG));
        };
        if !KNOWN_ENGINES.contains(&engine) {
            return Ok(DataSourceConfig::Unsupported(UnsupportedConfig { fields }));
        }

        let known: KnownEngine = serde_json::from_value(Value::Object(fields)).map_err(de::Error::custom)?;
        Ok(match known {
            KnownEngine::Postgres(c) => DataSourceConfig::Postgres(c),
            KnownEngine::MySql(c) => DataSourceConfig::MySql(c),
            KnownEngine::MariaDb(c) => DataSourceConfig::MariaDb(c),
            KnownEngine::SqlServer(c) => DataSourceConfig::SqlServer(c),
            KnownEngine::MongoDb(c) => DataSourceConfig::MongoDb(c),
            KnownEngine::Sqlite(c) => DataSourceConfig::Sqlite(c),
        })
    }
}

impl DataSourceConfig {
    /// Value exported as `DB_TYPE` and used in messages.
    pub fn engine_name(&self) -> &'static str {
        match self {
            DataSourceConfig::Postgres(_) => "postgresql",
            DataSourceConfig::MySql(_) => "mysql",
            DataSourceConfig::MariaDb(_) => "mariadb",
            DataSourceConfig::SqlServer(_) => "sqlserver",
            DataSourceConfig::MongoDb(_) => "mongodb",
            DataSourceConfig::Sqlite(_) => "sqlite",
            DataSourceConfig::Unsupported(_) => "unsupported",
        }
    }

    /// Engines that refuse to connect without a password.
    pub fn requires_password(&self) -> bool {
        matches!(
            self,
            DataSourceConfig::Postgres(_)
                | DataSourceConfig::MySql(_)
                | DataSourceConfig::MariaDb(_)
                | DataSourceConfig::SqlServer(_)
        )
    }

    pub fn encrypted_password(&self) -> Option<&str> {
        match self {
            DataSourceConfig::Postgres(c) => c.encrypted_password.as_deref(),
            DataSourceConfig::MySql(c) | DataSourceConfig::MariaDb(c) => c.encrypted_password.as_deref(),
            DataSourceConfig::SqlServer(c) => c.encrypted_password.as_deref(),
            DataSourceConfig::MongoDb(c) => c.encrypted_password.as_deref(),
            DataSourceConfig::Sqlite(_) => None,
            DataSourceConfig::Unsupported(raw) => raw.fields.get("encrypted_password").and_then(Value::as_str),
        }
    }

    /// Replace the stored ciphertext. No-op for SQLite.
    pub fn set_encrypted_password(&mut self, ciphertext: Option<String>) {
        match self {
            DataSourceConfig::Postgres(c) => c.encrypted_password = ciphertext,
            DataSourceConfig::MySql(c) | DataSourceConfig::MariaDb(c) => c.encrypted_password = ciphertext,
            DataSourceConfig::SqlServer(c) => c.encrypted_password = ciphertext,
            DataSourceConfig::MongoDb(c) => c.encrypted_password = ciphertext,
            DataSourceConfig::Sqlite(_) => {}
            DataSourceConfig::Unsupported(raw) => match ciphertext {
                Some(c) => {
                    raw.fields.insert("encrypted_password".into(), Value::String(c));
                }
                None => {
                    raw.fields.remove("encrypted_password");
                }
            },
        }
    }
}

/// A documentation file mounted into the sandbox at `/docs/<filename>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocArtifact {
    pub filename: String,
    pub content: String,
}

/// Outcome of the last connection test, persisted on the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub tested_at: DateTime<Utc>,
}

/// A user-owned database registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub connection: DataSourceConfig,
    #[serde(default)]
    pub documentation: Vec<DocArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<ConnectionTestResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSource {
    /// Copy safe to hand to API clients: the ciphertext is dropped.
    pub fn redacted(&self) -> DataSource {
        let mut copy = self.clone();
        copy.connection.set_encrypted_password(None);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_type_tags_round_through_json() {
        let config: DataSourceConfig = serde_json::from_value(json!({
            "engine_type": "postgresql",
            "host": "db.internal",
            "database": "app",
            "username": "reader",
            "ssl_mode": "verify-full",
        }))
        .unwrap();

        let DataSourceConfig::Postgres(pg) = &config else {
            panic!("expected postgres, got {config:?}");
        };
        assert_eq!(pg.port, 5432);
        assert_eq!(pg.ssl_mode, SslMode::VerifyFull);
        assert_eq!(config.engine_name(), "postgresql");
        assert!(config.requires_password());
    }

    #[test]
    fn mariadb_shares_mysql_config() {
        let config: DataSourceConfig = serde_json::from_value(json!({
            "engine_type": "mariadb",
            "host": "maria",
            "database": "shop",
            "username": "root",
        }))
        .unwrap();
        assert!(matches!(config, DataSourceConfig::MariaDb(ref c) if c.port == 3306));
    }

    #[test]
    fn unknown_engine_is_unsupported() {
        let config: DataSourceConfig = serde_json::from_value(json!({
            "engine_type": "oracle",
            "host": "legacy",
        }))
        .unwrap();
        let DataSourceConfig::Unsupported(raw) = &config else {
            panic!("expected unsupported, got {config:?}");
        };
        assert_eq!(raw.engine_type(), "oracle");
        assert!(!config.requires_password());
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({ "engine_type": "oracle", "host": "legacy" })
        );
    }

    #[test]
    fn known_engine_with_bad_fields_is_an_error() {
        let err = serde_json::from_value::<DataSourceConfig>(json!({ "engine_type": "postgresql", "host": "db" }));
        assert!(err.is_err());
        assert!(serde_json::from_value::<DataSourceConfig>(json!({ "host": "db" })).is_err());
    }

    #[test]
    fn unsupported_redaction_strips_stored_ciphertext() {
        let mut config: DataSourceConfig = serde_json::from_value(json!({
            "engine_type": "db2",
            "host": "mainframe",
            "encrypted_password": "c2VjcmV0",
        }))
        .unwrap();
        assert_eq!(config.encrypted_password(), Some("c2VjcmV0"));
        config.set_encrypted_password(None);
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({ "engine_type": "db2", "host": "mainframe" })
        );
    }

    #[test]
    fn mongo_and_sqlite_do_not_require_passwords() {
        let mongo: DataSourceConfig =
            serde_json::from_value(json!({ "engine_type": "mongodb", "host": "m", "database": "d" })).unwrap();
        let sqlite: DataSourceConfig = serde_json::from_value(json!({ "engine_type": "sqlite" })).unwrap();
        assert!(!mongo.requires_password());
        assert!(!sqlite.requires_password());
        assert!(sqlite.encrypted_password().is_none());
    }

    #[test]
    fn redacted_drops_ciphertext() {
        let ds = DataSource {
            id: "ds-1".into(),
            owner_id: "user-1".into(),
            name: "prod".into(),
            connection: DataSourceConfig::MySql(MySqlConfig {
                host: "h".into(),
                port: 3306,
                database: "d".into(),
                username: "u".into(),
                ssl_mode: SslMode::Require,
                encrypted_password: Some("c2VjcmV0".into()),
            }),
            documentation: vec![],
            last_test: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&ds.redacted()).unwrap();
        assert!(!json.contains("encrypted_password"));
        assert_eq!(ds.connection.encrypted_password(), Some("c2VjcmV0"));
    }

    #[test]
    fn ssl_mode_policy() {
        assert!(!SslMode::Disable.is_enabled());
        assert!(SslMode::Require.accepts_invalid_certs());
        assert!(!SslMode::VerifyCa.accepts_invalid_certs());
        assert!(!SslMode::VerifyFull.accepts_invalid_certs());
    }
}
