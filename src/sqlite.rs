use crate::backend::{undecodable, DatabaseBackend, QueryResult, QueryRow};
use crate::builder::DATETIME_FORMAT;
use crate::dialect::Dialect;
use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDateTime;
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::debug;

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        Self::with_pool(url, SqlitePoolOptions::new().max_connections(5)).await
    }

    async fn with_pool(url: &str, pool_options: SqlitePoolOptions) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = pool_options.connect_with(options).await?;
        debug!(url, "sqlite pool connected");

        Ok(Self { pool })
    }

    /// Create an in-memory SQLite database.
    ///
    /// Each connection of an in-memory database sees its own data, so the pool
    /// keeps exactly one connection alive for its whole lifetime.
    pub async fn memory() -> Result<Self> {
        let pool_options = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::with_pool("sqlite::memory:", pool_options).await
    }

    /// Create a file-based SQLite database
    pub async fn file(path: &str) -> Result<Self> {
        Self::new(&format!("sqlite://{}", path)).await
    }

    /// Get list of all tables
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>("name")).collect())
    }

    /// Convert SQLite row to QueryRow
    fn convert_row(row: &SqliteRow) -> Result<QueryRow> {
        let mut query_row = QueryRow::new();

        for column in row.columns() {
            let index = column.ordinal();
            let name = column.name().to_string();

            if row.try_get_raw(index)?.is_null() {
                query_row.insert(name, Value::Null);
                continue;
            }

            let value = if let Ok(value) = row.try_get::<i64, _>(index) {
                Value::Number(value.into())
            } else if let Ok(value) = row.try_get::<f64, _>(index) {
                Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
            } else if let Ok(value) = row.try_get::<String, _>(index) {
                Value::String(value)
            } else if let Ok(value) = row.try_get::<NaiveDateTime, _>(index) {
                Value::String(value.format(DATETIME_FORMAT).to_string())
            } else if let Ok(value) = row.try_get::<bool, _>(index) {
                Value::Bool(value)
            } else if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
                match String::from_utf8(value) {
                    Ok(text) => Value::String(text),
                    Err(err) => Value::String(STANDARD.encode(err.into_bytes())),
                }
            } else {
                return Err(undecodable(&name, column.type_info().name()));
            };
            query_row.insert(name, value);
        }

        Ok(query_row)
    }
}

fn bind<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn connect(url: &str) -> Result<Self> {
        Self::new(url).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let query = params.iter().fold(sqlx::query(sql), bind);
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let query = params.iter().fold(sqlx::query(sql), bind);
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::convert_row).collect()
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
