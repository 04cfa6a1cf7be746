use std::time::Duration;

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, Config, Connection, NoTls, SimpleQueryMessage};

use super::{AdapterError, QueryOutput, Row, float_value};
use crate::datasources::{PostgresConfig, SslMode};
use crate::vault::Plaintext;

fn build_config(cfg: &PostgresConfig, password: &Plaintext, connect_timeout: Duration) -> Config {
    let mut config = Config::new();
    config
        .host(&cfg.host)
        .port(cfg.port)
        .dbname(&cfg.database)
        .user(&cfg.username)
        .password(password.expose())
        .application_name("dbrelay")
        .connect_timeout(connect_timeout);
    if let Some(schema) = cfg.schema.as_deref().filter(|s| !s.is_empty()) {
        config.options(&format!("-c search_path={schema}"));
    }
    config.ssl_mode(if cfg.ssl_mode.is_enabled() {
        tokio_postgres::config::SslMode::Require
    } else {
        tokio_postgres::config::SslMode::Disable
    });
    config
}

fn tls_connector(mode: SslMode) -> Result<MakeTlsConnector, AdapterError> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(AdapterError::driver)?;
    if mode.accepts_invalid_certs() {
        builder.set_verify(SslVerifyMode::NONE);
    }
    let mut connector = MakeTlsConnector::new(builder.build());
    if mode == SslMode::VerifyCa {
        connector.set_callback(|conf, _host| {
            conf.set_verify_hostname(false);
            Ok(())
        });
    }
    Ok(connector)
}

fn spawn_connection<S, T>(connection: Connection<S, T>) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "postgres connection closed with error");
        }
    })
}

async fn connect(
    cfg: &PostgresConfig,
    password: &Plaintext,
    connect_timeout: Duration,
) -> Result<(Client, JoinHandle<()>), AdapterError> {
    let config = build_config(cfg, password, connect_timeout);
    let connecting = async {
        if cfg.ssl_mode.is_enabled() {
            let tls = tls_connector(cfg.ssl_mode)?;
            let (client, connection) = config.connect(tls).await.map_err(AdapterError::driver)?;
            Ok::<_, AdapterError>((client, spawn_connection(connection)))
        } else {
            let (client, connection) = config.connect(NoTls).await.map_err(AdapterError::driver)?;
            Ok((client, spawn_connection(connection)))
        }
    };
    tokio::time::timeout(connect_timeout, connecting)
        .await
        .map_err(|_| AdapterError::timeout(connect_timeout))?
}

/// Drop the client and wait for the connection task to wind down.
async fn close(client: Client, task: JoinHandle<()>) {
    drop(client);
    if let Err(e) = task.await {
        tracing::warn!(error = %e, "postgres connection task failed");
    }
}

pub async fn execute(
    cfg: &PostgresConfig,
    password: &Plaintext,
    query: &str,
    connect_timeout: Duration,
) -> Result<QueryOutput, AdapterError> {
    let (client, task) = connect(cfg, password, connect_timeout).await?;
    let result = run_query(&client, query).await;
    close(client, task).await;
    result
}

pub async fn ping(cfg: &PostgresConfig, password: &Plaintext, connect_timeout: Duration) -> Result<(), AdapterError> {
    let (client, task) = connect(cfg, password, connect_timeout).await?;
    let result = client.simple_query("SELECT 1").await.map(|_| ()).map_err(AdapterError::driver);
    close(client, task).await;
    result
}

async fn run_query(client: &Client, query: &str) -> Result<QueryOutput, AdapterError> {
    // Prepared metadata gives column types for a single statement; the
    // simple protocol runs anything, including multi-statement scripts.
    // This costs one extra round trip per query. When prepare fails (scripts,
    // some utility commands) every value comes back as a JSON string.
    let types: Option<Vec<Type>> = client
        .prepare(query)
        .await
        .ok()
        .map(|stmt| stmt.columns().iter().map(|c| c.type_().clone()).collect());

    let messages = client.simple_query(query).await.map_err(AdapterError::driver)?;

    let mut output = QueryOutput::default();
    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                output.columns = columns.iter().map(|c| c.name().to_string()).collect();
                output.rows.clear();
            }
            SimpleQueryMessage::Row(row) => {
                if output.columns.is_empty() {
                    output.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let mut map = Row::new();
                for (idx, name) in output.columns.iter().enumerate() {
                    let ty = types.as_ref().and_then(|t| t.get(idx));
                    map.insert(name.clone(), text_to_json(row.get(idx), ty));
                }
                output.rows.push(map);
            }
            _ => {}
        }
    }
    Ok(output)
}

/// Convert a text-protocol value using the column type when known.
fn text_to_json(text: Option<&str>, ty: Option<&Type>) -> Value {
    let Some(text) = text else {
        return Value::Null;
    };
    let Some(ty) = ty else {
        return Value::String(text.to_string());
    };

    if *ty == Type::BOOL {
        Value::Bool(text == "t")
    } else if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 || *ty == Type::OID {
        text.parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string()))
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        text.parse::<f64>()
            .map(float_value)
            .unwrap_or_else(|_| Value::String(text.to_string()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
    } else {
        Value::String(text.to_string())
    }
}
