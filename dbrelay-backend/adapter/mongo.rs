//! MongoDB queries are JSON envelopes:
//!
//! ```json
//! {"collection": "users", "query": {"active": true}, "limit": 50}
//! {"collection": "orders", "aggregation": [{"$match": {}}, {"$count": "n"}]}
//! ```

use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::{ClientOptions, Credential, FindOptions, ServerAddress, Tls, TlsOptions};
use mongodb::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{AdapterError, QueryOutput, Row};
use crate::datasources::MongoConfig;
use crate::vault::Plaintext;

/// Applied to `find` when the envelope does not set a limit.
const DEFAULT_FIND_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    collection: String,
    #[serde(default)]
    query: Option<Value>,
    #[serde(default)]
    aggregation: Option<Vec<Value>>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, PartialEq)]
enum MongoCommand {
    Find {
        collection: String,
        filter: Document,
        limit: i64,
    },
    Aggregate {
        collection: String,
        pipeline: Vec<Document>,
    },
}

fn to_document(value: Value, what: &str) -> Result<Document, AdapterError> {
    match Bson::try_from(value) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(_) => Err(AdapterError::InvalidQuery(format!("{what} must be a JSON object"))),
        Err(e) => Err(AdapterError::InvalidQuery(format!("{what} is not valid extended JSON: {e}"))),
    }
}

fn parse_envelope(text: &str) -> Result<MongoCommand, AdapterError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
        AdapterError::InvalidQuery(format!(
            "expected {{\"collection\": ..., \"query\"|\"aggregation\": ...}}: {e}"
        ))
    })?;
    if envelope.collection.trim().is_empty() {
        return Err(AdapterError::InvalidQuery("collection must not be empty".into()));
    }

    match (envelope.query, envelope.aggregation) {
        (Some(_), Some(_)) => Err(AdapterError::InvalidQuery(
            "set either query or aggregation, not both".into(),
        )),
        (_, Some(stages)) => {
            let mut pipeline = stages
                .into_iter()
                .map(|stage| to_document(stage, "aggregation stage"))
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(limit) = envelope.limit {
                pipeline.push(doc! { "$limit": limit });
            }
            Ok(MongoCommand::Aggregate {
                collection: envelope.collection,
                pipeline,
            })
        }
        (query, None) => {
            let filter = match query {
                Some(Value::Null) | None => Document::new(),
                Some(value) => to_document(value, "query")?,
            };
            Ok(MongoCommand::Find {
                collection: envelope.collection,
                filter,
                limit: envelope.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_FIND_LIMIT),
            })
        }
    }
}

async fn client_options(
    cfg: &MongoConfig,
    password: Option<&Plaintext>,
    connect_timeout: Duration,
) -> Result<ClientOptions, AdapterError> {
    let mut options = match cfg.connection_string.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(uri) => ClientOptions::parse(uri).await.map_err(AdapterError::driver)?,
        None => ClientOptions::builder()
            .hosts(vec![ServerAddress::Tcp {
                host: cfg.host.clone(),
                port: Some(cfg.port),
            }])
            .build(),
    };

    if let (Some(username), Some(password)) = (cfg.username.as_deref().filter(|u| !u.is_empty()), password) {
        let mut credential = Credential::default();
        credential.username = Some(username.to_string());
        credential.password = Some(password.expose().to_string());
        credential.source = cfg.auth_database.clone().filter(|s| !s.is_empty());
        options.credential = Some(credential);
    }
    if let Some(replica_set) = cfg.replica_set.as_deref().filter(|s| !s.is_empty()) {
        options.repl_set_name = Some(replica_set.to_string());
    }
    if cfg.ssl_mode.is_enabled() {
        let mut tls = TlsOptions::default();
        tls.allow_invalid_certificates = Some(cfg.ssl_mode.accepts_invalid_certs());
        options.tls = Some(Tls::Enabled(tls));
    }
    options.app_name = Some("dbrelay".to_string());
    options.connect_timeout = Some(connect_timeout);
    options.server_selection_timeout = Some(connect_timeout);
    Ok(options)
}

pub async fn execute(
    cfg: &MongoConfig,
    password: Option<&Plaintext>,
    query: &str,
    connect_timeout: Duration,
) -> Result<QueryOutput, AdapterError> {
    let command = parse_envelope(query)?;
    let client = Client::with_options(client_options(cfg, password, connect_timeout).await?)
        .map_err(AdapterError::driver)?;
    let result = run_command(&client, &cfg.database, command).await;
    client.shutdown().await;
    result
}

pub async fn ping(cfg: &MongoConfig, password: Option<&Plaintext>, connect_timeout: Duration) -> Result<(), AdapterError> {
    let client = Client::with_options(client_options(cfg, password, connect_timeout).await?)
        .map_err(AdapterError::driver)?;
    let result = client
        .database(&cfg.database)
        .run_command(doc! { "ping": 1 }, None)
        .await
        .map(|_| ())
        .map_err(AdapterError::driver);
    client.shutdown().await;
    result
}

async fn run_command(client: &Client, database: &str, command: MongoCommand) -> Result<QueryOutput, AdapterError> {
    let db = client.database(database);
    let documents: Vec<Document> = match command {
        MongoCommand::Find {
            collection,
            filter,
            limit,
        } => {
            let mut options = FindOptions::default();
            options.limit = Some(limit);
            db.collection::<Document>(&collection)
                .find(filter, options)
                .await
                .map_err(AdapterError::driver)?
                .try_collect()
                .await
                .map_err(AdapterError::driver)?
        }
        MongoCommand::Aggregate { collection, pipeline } => db
            .collection::<Document>(&collection)
            .aggregate(pipeline, None)
            .await
            .map_err(AdapterError::driver)?
            .try_collect()
            .await
            .map_err(AdapterError::driver)?,
    };
    Ok(normalize(documents))
}

/// Columns are the keys of the first document; every document becomes a
/// relaxed extended-JSON row.
fn normalize(documents: Vec<Document>) -> QueryOutput {
    let columns = documents
        .first()
        .map(|d| d.keys().cloned().collect())
        .unwrap_or_default();
    let rows = documents
        .into_iter()
        .map(|d| match Bson::Document(d).into_relaxed_extjson() {
            Value::Object(map) => map,
            other => {
                let mut row = Row::new();
                row.insert("value".to_string(), other);
                row
            }
        })
        .collect();
    QueryOutput { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::SslMode;
    use serde_json::json;

    #[test]
    fn parses_find_envelope() {
        let cmd = parse_envelope(r#"{"collection": "users", "query": {"active": true}, "limit": 5}"#).unwrap();
        assert_eq!(
            cmd,
            MongoCommand::Find {
                collection: "users".into(),
                filter: doc! { "active": true },
                limit: 5,
            }
        );
    }

    #[test]
    fn find_without_query_uses_empty_filter_and_default_limit() {
        let cmd = parse_envelope(r#"{"collection": "users"}"#).unwrap();
        assert_eq!(
            cmd,
            MongoCommand::Find {
                collection: "users".into(),
                filter: Document::new(),
                limit: DEFAULT_FIND_LIMIT,
            }
        );
    }

    #[test]
    fn aggregation_limit_appends_stage() {
        let cmd = parse_envelope(r#"{"collection": "orders", "aggregation": [{"$match": {}}], "limit": 3}"#).unwrap();
        let MongoCommand::Aggregate { pipeline, .. } = cmd else {
            panic!("expected aggregate");
        };
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline[1], doc! { "$limit": 3_i64 });
    }

    #[test]
    fn malformed_envelopes_are_invalid_queries() {
        for text in [
            "db.users.find({})",
            r#"{"query": {}}"#,
            r#"{"collection": ""}"#,
            r#"{"collection": "c", "query": [1, 2]}"#,
            r#"{"collection": "c", "aggregation": [1]}"#,
            r#"{"collection": "c", "query": {}, "aggregation": []}"#,
            r#"{"collection": "c", "sort": {"a": 1}}"#,
        ] {
            let err = parse_envelope(text).unwrap_err();
            assert!(matches!(err, AdapterError::InvalidQuery(_)), "{text}: {err:?}");
        }
    }

    #[test]
    fn normalize_uses_first_document_keys() {
        let output = normalize(vec![doc! { "_id": 1, "name": "a" }, doc! { "name": "b", "extra": true }]);
        assert_eq!(output.columns, vec!["_id", "name"]);
        assert_eq!(output.rows.len(), 2);
        assert_eq!(Value::Object(output.rows[1].clone()), json!({"name": "b", "extra": true}));
    }

    #[test]
    fn normalize_empty_is_empty() {
        let output = normalize(vec![]);
        assert!(output.columns.is_empty());
        assert!(output.rows.is_empty());
    }

    #[tokio::test]
    async fn options_carry_credentials_and_tls() {
        let vault = crate::vault::test_vault();
        let password = vault.decrypt(&vault.encrypt("pw").unwrap()).unwrap();
        let cfg = MongoConfig {
            host: "mongo".into(),
            port: 27018,
            database: "app".into(),
            connection_string: None,
            username: Some("admin".into()),
            auth_database: Some("admin".into()),
            replica_set: Some("rs0".into()),
            ssl_mode: SslMode::Require,
            encrypted_password: None,
        };
        let options = client_options(&cfg, Some(&password), Duration::from_secs(10)).await.unwrap();
        assert_eq!(options.repl_set_name.as_deref(), Some("rs0"));
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("admin"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
        assert!(matches!(options.tls, Some(Tls::Enabled(_))));
        assert_eq!(options.hosts, vec![ServerAddress::Tcp { host: "mongo".into(), port: Some(27018) }]);
    }

    #[tokio::test]
    async fn no_username_means_no_auth() {
        let cfg = MongoConfig {
            host: "mongo".into(),
            port: 27017,
            database: "app".into(),
            connection_string: None,
            username: None,
            auth_database: None,
            replica_set: None,
            ssl_mode: SslMode::Disable,
            encrypted_password: None,
        };
        let options = client_options(&cfg, None, Duration::from_secs(10)).await.unwrap();
        assert!(options.credential.is_none());
        assert!(options.tls.is_none());
    }

    /// Needs a live server: DBRELAY_TEST_MONGO_URI.
    #[tokio::test]
    #[ignore]
    async fn empty_aggregation_against_live_server() {
        let cfg = MongoConfig {
            host: String::new(),
            port: 27017,
            database: "dbrelay_test".into(),
            connection_string: Some(std::env::var("DBRELAY_TEST_MONGO_URI").unwrap()),
            username: None,
            auth_database: None,
            replica_set: None,
            ssl_mode: SslMode::Disable,
            encrypted_password: None,
        };
        let query = r#"{"collection": "does_not_exist", "aggregation": [{"$match": {"never": true}}]}"#;
        let output = execute(&cfg, None, query, Duration::from_secs(10)).await.unwrap();
        assert!(output.rows.is_empty());
        assert!(output.columns.is_empty());
    }
}
