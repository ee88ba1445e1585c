use crate::backend::{decimal_value, undecodable, DatabaseBackend, QueryResult, QueryRow};
use crate::builder::DATETIME_FORMAT;
use crate::dialect::Dialect;
use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDateTime;
use serde_json::{Number, Value};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::types::Decimal;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Create a new PostgreSQL backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        debug!("postgres pool connected");

        Ok(Self { pool })
    }

    /// Convert PostgreSQL row to QueryRow
    fn convert_row(row: &PgRow) -> Result<QueryRow> {
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
            } else if let Ok(value) = row.try_get::<i32, _>(index) {
                Value::Number(value.into())
            } else if let Ok(value) = row.try_get::<i16, _>(index) {
                Value::Number(value.into())
            } else if let Ok(value) = row.try_get::<f64, _>(index) {
                Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
            } else if let Ok(value) = row.try_get::<f32, _>(index) {
                Number::from_f64(value.into()).map(Value::Number).unwrap_or(Value::Null)
            } else if let Ok(value) = row.try_get::<Decimal, _>(index) {
                decimal_value(value.normalize().to_string())
            } else if let Ok(value) = row.try_get::<String, _>(index) {
                Value::String(value)
            } else if let Ok(value) = row.try_get::<bool, _>(index) {
                Value::Bool(value)
            } else if let Ok(value) = row.try_get::<NaiveDateTime, _>(index) {
                Value::String(value.format(DATETIME_FORMAT).to_string())
            } else if let Ok(value) = row.try_get::<Value, _>(index) {
                value
            } else if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
                Value::String(STANDARD.encode(value))
            } else {
                return Err(undecodable(&name, column.type_info().name()));
            };
            query_row.insert(name, value);
        }

        Ok(query_row)
    }
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
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
impl DatabaseBackend for PostgresBackend {
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
        Dialect::Postgres
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_connection() {
        let backend = PostgresBackend::connect("postgresql://localhost/test").await;
        assert!(backend.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_query() {
        let backend = PostgresBackend::connect("postgresql://localhost/test")
            .await
            .unwrap();

        backend
            .execute("CREATE TEMPORARY TABLE test_table (id BIGINT PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        backend
            .execute(
                "INSERT INTO test_table (id, name) VALUES ($1, $2)",
                &[json!(1), json!("Alice")],
            )
            .await
            .unwrap();

        let results = backend
            .query("SELECT * FROM test_table WHERE id = $1", &[json!(1)])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get_i64("id"), Some(1));
        assert_eq!(results[0].get_string("name"), Some("Alice".to_string()));
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_numeric_aggregates() {
        let backend = PostgresBackend::connect("postgresql://localhost/test")
            .await
            .unwrap();

        let results = backend
            .query(
                "SELECT SUM(v) AS total, CAST(2.5 AS NUMERIC) AS half \
                 FROM (VALUES (10::BIGINT), (20::BIGINT)) AS t(v)",
                &[],
            )
            .await
            .unwrap();

        assert_eq!(results[0].columns["total"], json!(30));
        assert_eq!(results[0].columns["half"], json!("2.5"));
    }
}
