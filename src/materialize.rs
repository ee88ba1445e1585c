//! Flat row to nested record materialization.

use crate::plan::ID_SEGMENT;
use crate::schema::SqlType;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A materialized row
pub type Record = Map<String, Value>;

/// Caller supplied transform run on every materialized row
pub type Middleware = Arc<dyn Fn(&mut Record) + Send + Sync>;

/// Per-column post-processing registered while compiling a projection
#[derive(Debug, Clone, PartialEq)]
pub enum FieldHandler {
    /// Normalize the value of a flat alias
    Coerce { alias: String, sql_type: SqlType },
    /// Move a dotted alias into nested objects, coercing on the way
    Unflatten { alias: String, sql_type: Option<SqlType> },
    /// Replace a comma separated id list with entities of a cached sibling
    Denormalize { alias: String, dependency: usize },
}

impl FieldHandler {
    /// Handler for a selected column, if it needs one
    pub fn for_column(alias: &str, sql_type: Option<SqlType>) -> Option<Self> {
        if alias.contains('.') {
            Some(FieldHandler::Unflatten {
                alias: alias.to_string(),
                sql_type,
            })
        } else {
            sql_type.filter(needs_coercion).map(|sql_type| FieldHandler::Coerce {
                alias: alias.to_string(),
                sql_type,
            })
        }
    }

    /// Run the handler on one record; `dependencies` are the id maps of cached siblings
    pub fn apply(&self, record: &mut Record, dependencies: &[Arc<EntityIndex>]) {
        match self {
            FieldHandler::Coerce { alias, sql_type } => {
                if let Some(value) = record.get_mut(alias) {
                    *value = coerce(sql_type, value.take());
                }
            }
            FieldHandler::Unflatten { alias, sql_type } => {
                unflatten(record, alias, sql_type.as_ref())
            }
            FieldHandler::Denormalize { alias, dependency } => {
                if let Some(index) = dependencies.get(*dependency) {
                    denormalize(record, alias, index);
                }
            }
        }
    }
}

fn needs_coercion(sql_type: &SqlType) -> bool {
    matches!(
        sql_type,
        SqlType::BigInt | SqlType::Integer | SqlType::SmallInt | SqlType::Boolean
    )
}

/// Normalize driver values: numeric strings to integers, 0/1 and text to booleans
pub fn coerce(sql_type: &SqlType, value: Value) -> Value {
    match (sql_type, value) {
        (_, Value::Null) => Value::Null,
        (SqlType::BigInt | SqlType::Integer | SqlType::SmallInt, Value::String(s)) => {
            // a zero fraction, as drivers print some integral decimals, is dropped
            let digits = match s.trim().split_once('.') {
                Some((whole, fraction)) if fraction.bytes().all(|b| b == b'0') => whole,
                Some(_) => return Value::String(s),
                None => s.trim(),
            };
            if let Ok(n) = digits.parse::<i64>() {
                Value::Number(n.into())
            } else if let Ok(n) = digits.parse::<u64>() {
                Value::Number(n.into())
            } else {
                Value::String(s)
            }
        }
        (SqlType::Boolean, Value::Number(n)) => match n.as_f64() {
            Some(f) => Value::Bool(f != 0.0),
            None => Value::Number(n),
        },
        (SqlType::Boolean, Value::String(s)) => match s.as_str() {
            "1" | "true" | "TRUE" | "t" => Value::Bool(true),
            "0" | "false" | "FALSE" | "f" => Value::Bool(false),
            _ => Value::String(s),
        },
        (_, value) => value,
    }
}

/// Move `record["a.b.c"]` to `record["a"]["b"]["c"]`, creating objects on demand
pub fn unflatten(record: &mut Record, alias: &str, sql_type: Option<&SqlType>) {
    let Some(value) = record.remove(alias) else {
        return;
    };
    let value = match sql_type {
        Some(sql_type) => coerce(sql_type, value),
        None => value,
    };

    let mut segments: Vec<&str> = alias.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut current = record;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(leaf.to_string(), value);
}

/// Cached entities of one sibling model keyed by their id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityIndex {
    entities: HashMap<String, Value>,
}

impl EntityIndex {
    /// Index records by their `$id`
    pub fn from_records(records: &[Record]) -> Self {
        let entities = records
            .iter()
            .filter_map(|record| {
                let id = id_key(record.get(ID_SEGMENT)?)?;
                Some((id, Value::Object(record.clone())))
            })
            .collect();
        Self { entities }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entities: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Split the concatenated ids under `alias` and look each one up; unknown ids become null
pub fn denormalize(record: &mut Record, alias: &str, index: &EntityIndex) {
    let Some(value) = record.get_mut(alias) else {
        return;
    };

    let ids = match value.take() {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    };

    *value = Value::Array(
        ids.iter()
            .map(|id| index.get(id).cloned().unwrap_or(Value::Null))
            .collect(),
    );
}

/// Run middlewares in registration order
pub fn run_middlewares(record: &mut Record, middlewares: &[Middleware]) {
    for middleware in middlewares {
        middleware(record);
    }
}

/// Turn a single-column JSON value into a record, if it is one
pub fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
