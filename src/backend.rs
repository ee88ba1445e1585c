use crate::dialect::Dialect;
use crate::error::Result;
use crate::materialize::Record;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Row from a query result, keyed by column alias
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    pub columns: Map<String, Value>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    /// Integer value; numeric strings are parsed
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.columns.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.columns.get(key).and_then(|v| v.as_bool())
    }

    pub fn into_record(self) -> Record {
        self.columns
    }
}

impl From<Record> for QueryRow {
    fn from(columns: Record) -> Self {
        Self { columns }
    }
}

/// Result of a query
pub type QueryResult = Vec<QueryRow>;

/// SQL execution engine.
///
/// Statements arrive with the dialect's placeholders and their values in bind
/// order. Implementations share a pool, so every method takes `&self`.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Connect to the database
    async fn connect(url: &str) -> Result<Self>
    where
        Self: Sized;

    /// Execute a SQL statement (no results)
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Query and return results
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Dialect spoken by this backend
    fn dialect(&self) -> Dialect;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(self) -> Result<()>
    where
        Self: Sized;

    /// Execute `;`-separated statements without parameters, such as generated DDL
    async fn execute_batch(&self, sql: &str) -> Result<()> {
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            self.execute(statement, &[]).await?;
        }
        Ok(())
    }
}

/// Value of a decoded DECIMAL/NUMERIC: whole numbers as integers, the rest as exact text
#[cfg(any(feature = "postgres", feature = "mysql"))]
pub(crate) fn decimal_value(text: String) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        Value::Number(n.into())
    } else if let Ok(n) = text.parse::<u64>() {
        Value::Number(n.into())
    } else {
        Value::String(text)
    }
}

/// Error for a column none of a backend's decoders accept
#[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
pub(crate) fn undecodable(column: &str, type_name: &str) -> crate::error::QueryError {
    crate::error::QueryError::Database(format!(
        "Cannot decode column {} of type {}",
        column, type_name
    ))
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Backend replaying canned rows; the first pattern contained in the SQL wins
    pub(crate) struct MockBackend {
        dialect: Dialect,
        responses: Vec<(String, Vec<Value>)>,
        log: Mutex<Vec<(String, Vec<Value>)>>,
    }

    impl MockBackend {
        pub(crate) fn new(dialect: Dialect) -> Self {
            Self {
                dialect,
                responses: Vec::new(),
                log: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn respond(mut self, pattern: &str, rows: Vec<Value>) -> Self {
            self.responses.push((pattern.to_string(), rows));
            self
        }

        pub(crate) fn statements(&self) -> Vec<(String, Vec<Value>)> {
            self.log.lock().unwrap().clone()
        }

        pub(crate) fn statements_like(&self, pattern: &str) -> Vec<(String, Vec<Value>)> {
            self.statements()
                .into_iter()
                .filter(|(sql, _)| sql.contains(pattern))
                .collect()
        }
    }

    #[async_trait]
    impl DatabaseBackend for MockBackend {
        async fn connect(_url: &str) -> Result<Self> {
            Ok(Self::new(Dialect::Sqlite))
        }

        async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
            self.log.lock().unwrap().push((sql.to_string(), params.to_vec()));
            Ok(1)
        }

        async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
            self.log.lock().unwrap().push((sql.to_string(), params.to_vec()));
            let rows = self
                .responses
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default();
            Ok(rows
                .into_iter()
                .filter_map(|row| match row {
                    Value::Object(columns) => Some(QueryRow { columns }),
                    _ => None,
                })
                .collect())
        }

        fn dialect(&self) -> Dialect {
            self.dialect
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_row_accessors() {
        let mut row = QueryRow::new();
        row.insert("id".into(), json!(3));
        row.insert("count".into(), json!("12"));
        row.insert("name".into(), json!("Ann"));
        row.insert("active".into(), json!(true));

        assert_eq!(row.get_i64("id"), Some(3));
        assert_eq!(row.get_i64("count"), Some(12));
        assert_eq!(row.get_string("name"), Some("Ann".to_string()));
        assert_eq!(row.get_bool("active"), Some(true));
        assert_eq!(row.get::<String>("name"), Some("Ann".to_string()));
        assert_eq!(row.get_i64("missing"), None);
        assert_eq!(row.into_record().len(), 4);
    }

    #[cfg(any(feature = "postgres", feature = "mysql"))]
    #[test]
    fn test_decimal_value() {
        assert_eq!(decimal_value("30".into()), json!(30));
        assert_eq!(decimal_value("18446744073709551615".into()), json!(18446744073709551615u64));
        assert_eq!(decimal_value("12.50".into()), json!("12.50"));
    }

    #[tokio::test]
    async fn test_execute_batch_splits_statements() {
        let backend = MockBackend::new(Dialect::Sqlite);
        backend
            .execute_batch("CREATE TABLE a (id INTEGER);\n\nCREATE TABLE b (id INTEGER);\n")
            .await
            .unwrap();

        let statements = backend.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].0, "CREATE TABLE b (id INTEGER)");
    }
}
