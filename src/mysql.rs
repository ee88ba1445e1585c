use crate::backend::{decimal_value, undecodable, DatabaseBackend, QueryResult, QueryRow};
use crate::builder::DATETIME_FORMAT;
use crate::dialect::Dialect;
use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDateTime;
use serde_json::{Number, Value};
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::types::Decimal;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;

pub struct MySqlBackend {
    pool: MySqlPool,
}

impl MySqlBackend {
    /// Create a new MySQL backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        debug!("mysql pool connected");

        Ok(Self { pool })
    }

    /// Convert MySQL row to QueryRow
    fn convert_row(row: &MySqlRow) -> Result<QueryRow> {
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
            } else if let Ok(value) = row.try_get::<u64, _>(index) {
                Value::Number(value.into())
            } else if let Ok(value) = row.try_get::<f64, _>(index) {
                Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
            } else if let Ok(value) = row.try_get::<Decimal, _>(index) {
                decimal_value(value.normalize().to_string())
            } else if let Ok(value) = row.try_get::<String, _>(index) {
                Value::String(value)
            } else if let Ok(value) = row.try_get::<bool, _>(index) {
                Value::Bool(value)
            } else if let Ok(value) = row.try_get::<NaiveDateTime, _>(index) {
                Value::String(value.format(DATETIME_FORMAT).to_string())
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
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> Query<'q, MySql, MySqlArguments> {
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
impl DatabaseBackend for MySqlBackend {
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
        Dialect::MySql
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
    #[ignore] // Requires MySQL running
    async fn test_mysql_query() {
        let backend = MySqlBackend::connect("mysql://root@localhost/test").await.unwrap();

        backend
            .execute("CREATE TEMPORARY TABLE test_table (id BIGINT PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        backend
            .execute("INSERT INTO test_table (id, name) VALUES (?, ?)", &[json!(1), json!("Alice")])
            .await
            .unwrap();

        let results = backend
            .query("SELECT id, name FROM test_table WHERE id = ?", &[json!(1)])
            .await
            .unwrap();

        assert_eq!(results[0].get_i64("id"), Some(1));
        assert_eq!(results[0].get_string("name"), Some("Alice".to_string()));

        let results = backend
            .query("SELECT SUM(id) AS total FROM test_table", &[])
            .await
            .unwrap();
        assert_eq!(results[0].columns["total"], json!(1));
    }
}
