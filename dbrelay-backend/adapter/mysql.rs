use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::Queryable;
use mysql_async::{Column, Conn, OptsBuilder, SslOpts, Value as MyValue};
use serde_json::Value;

use super::{AdapterError, QueryOutput, Row, float_value};
use crate::datasources::{MySqlConfig, SslMode};
use crate::vault::Plaintext;

fn build_opts(cfg: &MySqlConfig, password: &Plaintext) -> OptsBuilder {
    let mut opts = OptsBuilder::default()
        .ip_or_hostname(cfg.host.clone())
        .tcp_port(cfg.port)
        .db_name(Some(cfg.database.clone()))
        .user(Some(cfg.username.clone()))
        .pass(Some(password.expose().to_string()));
    if cfg.ssl_mode.is_enabled() {
        let ssl = SslOpts::default()
            .with_danger_accept_invalid_certs(cfg.ssl_mode.accepts_invalid_certs())
            .with_danger_skip_domain_validation(cfg.ssl_mode != SslMode::VerifyFull);
        opts = opts.ssl_opts(Some(ssl));
    }
    opts
}

async fn connect(cfg: &MySqlConfig, password: &Plaintext, connect_timeout: Duration) -> Result<Conn, AdapterError> {
    tokio::time::timeout(connect_timeout, Conn::new(build_opts(cfg, password)))
        .await
        .map_err(|_| AdapterError::timeout(connect_timeout))?
        .map_err(AdapterError::driver)
}

async fn disconnect(conn: Conn) {
    if let Err(e) = conn.disconnect().await {
        tracing::warn!(error = %e, "mysql disconnect failed");
    }
}

pub async fn execute(
    cfg: &MySqlConfig,
    password: &Plaintext,
    query: &str,
    connect_timeout: Duration,
) -> Result<QueryOutput, AdapterError> {
    let mut conn = connect(cfg, password, connect_timeout).await?;
    let result = run_query(&mut conn, query).await;
    disconnect(conn).await;
    result
}

pub async fn ping(cfg: &MySqlConfig, password: &Plaintext, connect_timeout: Duration) -> Result<(), AdapterError> {
    let mut conn = connect(cfg, password, connect_timeout).await?;
    let result = conn.ping().await.map_err(AdapterError::driver);
    disconnect(conn).await;
    result
}

async fn run_query(conn: &mut Conn, query: &str) -> Result<QueryOutput, AdapterError> {
    let mut result = conn.query_iter(query).await.map_err(AdapterError::driver)?;
    let columns: Vec<Column> = result.columns_ref().to_vec();
    let rows: Vec<mysql_async::Row> = result.collect().await.map_err(AdapterError::driver)?;
    result.drop_result().await.map_err(AdapterError::driver)?;

    let names: Vec<String> = columns.iter().map(|c| c.name_str().into_owned()).collect();
    let rows = rows
        .iter()
        .map(|row| {
            names
                .iter()
                .zip(&columns)
                .enumerate()
                .map(|(idx, (name, column))| {
                    let value = row.as_ref(idx).map(|v| to_json(v, column)).unwrap_or(Value::Null);
                    (name.clone(), value)
                })
                .collect::<Row>()
        })
        .collect();

    Ok(QueryOutput { columns: names, rows })
}

fn to_json(value: &MyValue, column: &Column) -> Value {
    match value {
        MyValue::NULL => Value::Null,
        MyValue::Int(i) => Value::from(*i),
        MyValue::UInt(u) => Value::from(*u),
        MyValue::Float(f) => float_value(f64::from(*f)),
        MyValue::Double(d) => float_value(*d),
        MyValue::Date(y, mo, d, h, mi, s, us) => {
            if *us > 0 {
                Value::String(format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}.{us:06}"))
            } else {
                Value::String(format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}"))
            }
        }
        MyValue::Time(neg, days, h, mi, s, _us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + days * 24;
            Value::String(format!("{sign}{hours:02}:{mi:02}:{s:02}"))
        }
        MyValue::Bytes(bytes) => bytes_to_json(bytes, column.column_type(), column.flags()),
    }
}

/// Text-protocol values arrive as bytes; recover numbers and JSON from the
/// column type.
fn bytes_to_json(bytes: &[u8], ty: ColumnType, flags: ColumnFlags) -> Value {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return Value::String(BASE64.encode(bytes));
    };

    match ty {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => {
            let parsed = if flags.contains(ColumnFlags::UNSIGNED_FLAG) {
                text.parse::<u64>().map(Value::from).ok()
            } else {
                text.parse::<i64>().map(Value::from).ok()
            };
            parsed.unwrap_or_else(|| Value::String(text.to_string()))
        }
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text
            .parse::<f64>()
            .map(float_value)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        ColumnType::MYSQL_TYPE_JSON => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}
