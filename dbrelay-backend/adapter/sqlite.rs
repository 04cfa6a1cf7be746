use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;

use super::{AdapterError, QueryOutput, Row, float_value};
use crate::datasources::SqliteConfig;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn file_path(cfg: &SqliteConfig) -> Result<PathBuf, AdapterError> {
    cfg.file_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .ok_or(AdapterError::MissingFilePath)
}

fn open(path: &Path) -> Result<Connection, AdapterError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(AdapterError::driver)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(AdapterError::driver)?;
    Ok(conn)
}

fn close(conn: Connection) {
    if let Err((_, e)) = conn.close() {
        tracing::warn!(error = %e, "sqlite close failed");
    }
}

/// rusqlite is blocking; run it off the async worker threads.
async fn blocking<T, F>(f: F) -> Result<T, AdapterError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AdapterError::Driver(format!("sqlite worker failed: {e}")))?
}

pub async fn execute(cfg: &SqliteConfig, query: &str) -> Result<QueryOutput, AdapterError> {
    let path = file_path(cfg)?;
    let query = query.to_string();
    blocking(move || {
        let conn = open(&path)?;
        let result = run_query(&conn, &query);
        close(conn);
        result
    })
    .await
}

pub async fn ping(cfg: &SqliteConfig) -> Result<(), AdapterError> {
    let path = file_path(cfg)?;
    blocking(move || {
        let conn = open(&path)?;
        let result = conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
            .map_err(AdapterError::driver);
        close(conn);
        result
    })
    .await
}

fn run_query(conn: &Connection, query: &str) -> Result<QueryOutput, AdapterError> {
    let mut stmt = conn.prepare(query).map_err(AdapterError::driver)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = Vec::new();
    let mut cursor = stmt.query([]).map_err(AdapterError::driver)?;
    while let Some(row) = cursor.next().map_err(AdapterError::driver)? {
        let mut map = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(AdapterError::driver)?;
            map.insert(name.clone(), to_json(value));
        }
        rows.push(map);
    }

    Ok(QueryOutput { columns, rows })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => float_value(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}
