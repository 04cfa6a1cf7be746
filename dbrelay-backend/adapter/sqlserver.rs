use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{AdapterError, QueryOutput, Row, float_value};
use crate::datasources::{SqlServerConfig, SslMode};
use crate::vault::Plaintext;

type SqlClient = Client<Compat<TcpStream>>;

fn build_config(cfg: &SqlServerConfig, password: &Plaintext) -> Config {
    let mut config = Config::new();
    config.host(&cfg.host);
    config.port(cfg.port);
    config.database(&cfg.database);
    config.application_name("dbrelay");
    config.authentication(AuthMethod::sql_server(&cfg.username, password.expose()));
    if let Some(instance) = cfg.instance_name.as_deref().filter(|s| !s.is_empty()) {
        config.instance_name(instance);
    }
    match cfg.ssl_mode {
        SslMode::Disable => config.encryption(EncryptionLevel::NotSupported),
        SslMode::Require => {
            config.encryption(EncryptionLevel::Required);
            config.trust_cert();
        }
        // The driver has no hostname-only bypass; both verify modes check the chain.
        SslMode::VerifyCa | SslMode::VerifyFull => config.encryption(EncryptionLevel::Required),
    }
    config
}

async fn connect(cfg: &SqlServerConfig, password: &Plaintext, connect_timeout: Duration) -> Result<SqlClient, AdapterError> {
    let config = build_config(cfg, password);
    let connecting = async {
        let tcp = if cfg.instance_name.as_deref().is_some_and(|s| !s.is_empty()) {
            TcpStream::connect_named(&config).await.map_err(AdapterError::driver)?
        } else {
            TcpStream::connect(config.get_addr()).await.map_err(AdapterError::driver)?
        };
        tcp.set_nodelay(true).map_err(AdapterError::driver)?;
        Client::connect(config, tcp.compat_write())
            .await
            .map_err(AdapterError::driver)
    };
    tokio::time::timeout(connect_timeout, connecting)
        .await
        .map_err(|_| AdapterError::timeout(connect_timeout))?
}

async fn close(client: SqlClient) {
    if let Err(e) = client.close().await {
        tracing::warn!(error = %e, "sqlserver close failed");
    }
}

pub async fn execute(
    cfg: &SqlServerConfig,
    password: &Plaintext,
    query: &str,
    connect_timeout: Duration,
) -> Result<QueryOutput, AdapterError> {
    let mut client = connect(cfg, password, connect_timeout).await?;
    let result = run_query(&mut client, query).await;
    close(client).await;
    result
}

pub async fn ping(cfg: &SqlServerConfig, password: &Plaintext, connect_timeout: Duration) -> Result<(), AdapterError> {
    let mut client = connect(cfg, password, connect_timeout).await?;
    let result = match client.simple_query("SELECT 1").await {
        Ok(stream) => stream.into_results().await.map(|_| ()).map_err(AdapterError::driver),
        Err(e) => Err(AdapterError::driver(e)),
    };
    close(client).await;
    result
}

async fn run_query(client: &mut SqlClient, query: &str) -> Result<QueryOutput, AdapterError> {
    let mut stream = client.simple_query(query).await.map_err(AdapterError::driver)?;
    let columns: Vec<String> = stream
        .columns()
        .await
        .map_err(AdapterError::driver)?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = stream.into_first_result().await.map_err(AdapterError::driver)?;

    let rows = rows
        .into_iter()
        .map(|row| {
            columns
                .iter()
                .cloned()
                .zip(row.into_iter().map(|data| to_json(&data)))
                .collect::<Row>()
        })
        .collect();

    Ok(QueryOutput { columns, rows })
}

fn chrono_string<'a, T>(data: &'a ColumnData<'static>) -> Value
where
    T: FromSql<'a> + ToString,
{
    match T::from_sql(data) {
        Ok(Some(v)) => Value::String(v.to_string()),
        Ok(None) => Value::Null,
        Err(e) => Value::String(format!("<unreadable: {e}>")),
    }
}

fn to_json(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|f| float_value(f64::from(f))).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(float_value).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v.as_ref().map(|s| Value::String(s.to_string())).unwrap_or(Value::Null),
        ColumnData::Guid(v) => v.as_ref().map(|g| Value::String(g.to_string())).unwrap_or(Value::Null),
        ColumnData::Binary(v) => v.as_ref().map(|b| Value::String(BASE64.encode(b))).unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v.as_ref().map(|n| Value::String(n.to_string())).unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::String(x.clone().into_owned().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono_string::<NaiveDateTime>(data)
        }
        ColumnData::Date(_) => chrono_string::<NaiveDate>(data),
        ColumnData::Time(_) => chrono_string::<NaiveTime>(data),
        ColumnData::DateTimeOffset(_) => chrono_string::<DateTime<FixedOffset>>(data),
    }
}
