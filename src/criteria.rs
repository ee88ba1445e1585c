//! Named, parameterized predicates.

use crate::builder::{Condition, LogicalOp};
use crate::compiler::Compilation;
use crate::error::Result;
use crate::operators::{Operator, PredicateSink};
use crate::plan::{prefixed, JoinMode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A value fixed at definition time or computed on every application
#[derive(Clone)]
pub enum StaticValue {
    Fixed(Value),
    Computed(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl StaticValue {
    pub fn resolve(&self) -> Value {
        match self {
            StaticValue::Fixed(value) => value.clone(),
            StaticValue::Computed(compute) => compute(),
        }
    }
}

impl fmt::Debug for StaticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticValue::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            StaticValue::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// One predicate of a criteria definition
#[derive(Debug, Clone)]
pub struct Criterion {
    pub parameter: String,
    pub path: String,
    pub operator: Operator,
    pub value: Option<StaticValue>,
}

impl Criterion {
    pub fn new(parameter: &str, path: &str, operator: Operator) -> Self {
        Self {
            parameter: parameter.to_string(),
            path: path.to_string(),
            operator,
            value: None,
        }
    }

    /// Ignore the request and always compare against `value`
    pub fn fixed(mut self, value: Value) -> Self {
        self.value = Some(StaticValue::Fixed(value));
        self
    }

    /// Ignore the request and compare against a value computed on every application
    pub fn computed<F>(mut self, compute: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.value = Some(StaticValue::Computed(Arc::new(compute)));
        self
    }

    /// The value to compare against, if any.
    ///
    /// A request bag is an object keyed by parameter name; a criteria definition
    /// with a single predicate also accepts the bare value.
    fn value(&self, bag: &Value, single: bool) -> Option<Value> {
        if let Some(value) = &self.value {
            return Some(value.resolve());
        }
        match bag {
            Value::Object(map) => map.get(&self.parameter).cloned(),
            other if single => Some(other.clone()),
            _ => None,
        }
    }
}

/// Criteria definition: predicates combined with AND or OR
#[derive(Debug, Clone)]
pub struct CriteriaSpec {
    combinator: LogicalOp,
    items: Vec<Criterion>,
}

impl CriteriaSpec {
    /// Every predicate must hold
    pub fn all(items: Vec<Criterion>) -> Self {
        Self {
            combinator: LogicalOp::And,
            items,
        }
    }

    /// Any predicate may hold
    pub fn any(items: Vec<Criterion>) -> Self {
        Self {
            combinator: LogicalOp::Or,
            items,
        }
    }

    pub fn single(parameter: &str, path: &str, operator: Operator) -> Self {
        Self::all(vec![Criterion::new(parameter, path, operator)])
    }

    pub fn combinator(&self) -> LogicalOp {
        self.combinator
    }

    pub fn items(&self) -> &[Criterion] {
        &self.items
    }

    /// Apply the predicates with the request's value bag.
    ///
    /// Predicates crossing a to-many association in a grouped query are moved to
    /// HAVING as "at least one matching row"; everything else lands in WHERE.
    pub fn apply(
        &self,
        compilation: &mut Compilation<'_>,
        values: &Value,
        prefix: &str,
    ) -> Result<()> {
        let mut sink = PredicateSink::new();
        let mut to_many = false;
        let single = self.items.len() == 1;

        for item in &self.items {
            let value = match item.value(values, single) {
                Some(value) => value,
                None if item.operator.takes_value() => continue,
                None => Value::Null,
            };

            let path = prefixed(prefix, &item.path);
            let resolved = compilation.resolve(&path, JoinMode::Left)?;
            to_many |= resolved.is_to_many;

            item.operator.apply(&mut sink, &resolved.column, &value, &item.parameter)?;
        }

        let PredicateSink { expression, statement } = sink;

        if !expression.is_empty() {
            let condition = Condition::combine(expression, self.combinator);
            if to_many && compilation.is_grouped() {
                let fragment = condition.to_fragment();
                let matches = compilation
                    .functions()
                    .sum(&format!("CASE WHEN {} THEN 1 ELSE 0 END", fragment.sql));
                trace!(condition = %fragment.sql, "criteria moved to HAVING");
                compilation
                    .query_mut()
                    .having(Condition::raw_with(format!("{} > 0", matches), fragment.values));
            } else {
                compilation.query_mut().and_where(condition);
            }
        }

        for condition in statement {
            compilation.query_mut().and_where(condition);
        }

        Ok(())
    }
}
