//! Criteria operators.
//!
//! Each operator turns a column reference and a value into conditions pushed
//! onto a [`PredicateSink`]. Most conditions go to the composable expression;
//! `BETWEEN` is emitted directly on the statement.

use crate::builder::{ComparisonOp, Condition};
use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Escape character used by the LIKE family
const LIKE_ESCAPE: char = '*';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equal,
    NotEqual,
    LessEqual,
    GreaterEqual,
    LessThan,
    GreaterThan,
    Like,
    Ilike,
    IlikeStart,
    Between,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    /// Reserved, never implemented
    Has,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::LessEqual => "LESS_EQUAL",
            Operator::GreaterEqual => "GREATER_EQUAL",
            Operator::LessThan => "LESS_THAN",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::Like => "LIKE",
            Operator::Ilike => "ILIKE",
            Operator::IlikeStart => "ILIKE_START",
            Operator::Between => "BETWEEN",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::IsNull => "IS_NULL",
            Operator::IsNotNull => "IS_NOT_NULL",
            Operator::Has => "HAS",
        }
    }

    /// Whether the operator reads a value at all
    pub fn takes_value(&self) -> bool {
        !matches!(self, Operator::IsNull | Operator::IsNotNull)
    }

    /// Push the predicate for `column` and `value` onto the sink.
    ///
    /// `parameter` only names the value in error messages.
    pub fn apply(
        self,
        sink: &mut PredicateSink,
        column: &str,
        value: &Value,
        parameter: &str,
    ) -> Result<()> {
        match self {
            Operator::Equal | Operator::NotEqual if value.is_null() => {
                let op = if self == Operator::Equal {
                    ComparisonOp::IsNull
                } else {
                    ComparisonOp::IsNotNull
                };
                sink.push(Condition::Simple {
                    column: column.to_string(),
                    op,
                    value: None,
                });
            }
            Operator::Equal
            | Operator::NotEqual
            | Operator::LessEqual
            | Operator::GreaterEqual
            | Operator::LessThan
            | Operator::GreaterThan => {
                let op = match self {
                    Operator::Equal => ComparisonOp::Eq,
                    Operator::NotEqual => ComparisonOp::Ne,
                    Operator::LessEqual => ComparisonOp::Le,
                    Operator::GreaterEqual => ComparisonOp::Ge,
                    Operator::LessThan => ComparisonOp::Lt,
                    _ => ComparisonOp::Gt,
                };
                sink.push(Condition::simple(column, op, scalar(value, parameter)?));
            }
            Operator::IsNull => sink.push(Condition::is_null(column)),
            Operator::IsNotNull => sink.push(Condition::Simple {
                column: column.to_string(),
                op: ComparisonOp::IsNotNull,
                value: None,
            }),
            Operator::Like => {
                let pattern = format!("%{}%", escape_like(&text(value, parameter)?));
                sink.push(Condition::raw_with(
                    format!("{} LIKE ? ESCAPE '{}'", column, LIKE_ESCAPE),
                    vec![Value::String(pattern)],
                ));
            }
            Operator::Ilike | Operator::IlikeStart => {
                let escaped = escape_like(&text(value, parameter)?.to_uppercase());
                let pattern = if self == Operator::Ilike {
                    format!("%{}%", escaped)
                } else {
                    format!("{}%", escaped)
                };
                sink.push(Condition::raw_with(
                    format!("UPPER({}) LIKE ? ESCAPE '{}'", column, LIKE_ESCAPE),
                    vec![Value::String(pattern)],
                ));
            }
            Operator::Between => match value.as_array().map(Vec::as_slice) {
                Some([low, high]) => sink.statement.push(Condition::raw_with(
                    format!("{} BETWEEN ? AND ?", column),
                    vec![low.clone(), high.clone()],
                )),
                _ => {
                    return Err(QueryError::invalid_value(
                        parameter,
                        "BETWEEN expects an array with two bounds",
                    ))
                }
            },
            Operator::In | Operator::NotIn => {
                let items = match value {
                    Value::Array(items) => items.clone(),
                    Value::Null => Vec::new(),
                    other => vec![other.clone()],
                };
                if items.is_empty() {
                    sink.push(Condition::Constant(self == Operator::NotIn));
                } else {
                    let op = if self == Operator::In {
                        ComparisonOp::In
                    } else {
                        ComparisonOp::NotIn
                    };
                    sink.push(Condition::simple(column, op, Value::Array(items)));
                }
            }
            Operator::Has => return Err(QueryError::UnsupportedOperator(self.name().to_string())),
        }

        Ok(())
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Destination of the conditions produced by operators
#[derive(Debug, Default)]
pub struct PredicateSink {
    /// Conditions combined with the criterion's AND/OR combinator
    pub expression: Vec<Condition>,
    /// Conditions placed on the statement's WHERE as-is
    pub statement: Vec<Condition>,
}

impl PredicateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, condition: Condition) {
        self.expression.push(condition);
    }

    pub fn is_empty(&self) -> bool {
        self.expression.is_empty() && self.statement.is_empty()
    }

    /// Every condition, expression first
    pub fn into_conditions(self) -> Vec<Condition> {
        let mut conditions = self.expression;
        conditions.extend(self.statement);
        conditions
    }
}

/// Escape `%`, `_` and the escape character itself
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

fn scalar(value: &Value, parameter: &str) -> Result<Value> {
    match value {
        Value::Array(_) | Value::Object(_) => Err(QueryError::invalid_value(
            parameter,
            "expected a scalar value",
        )),
        other => Ok(other.clone()),
    }
}

fn text(value: &Value, parameter: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(QueryError::invalid_value(parameter, "expected a text value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(operator: Operator, value: Value) -> PredicateSink {
        let mut sink = PredicateSink::new();
        operator.apply(&mut sink, "t.col", &value, "param").unwrap();
        sink
    }

    fn rendered(sink: &PredicateSink) -> (String, Vec<Value>) {
        let fragment = sink.expression[0].to_fragment();
        (fragment.sql, fragment.values)
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            rendered(&apply(Operator::Equal, json!(3))),
            ("t.col = ?".to_string(), vec![json!(3)])
        );
        assert_eq!(rendered(&apply(Operator::NotEqual, json!("a"))).0, "t.col <> ?");
        assert_eq!(rendered(&apply(Operator::LessEqual, json!(1))).0, "t.col <= ?");
        assert_eq!(rendered(&apply(Operator::GreaterEqual, json!(1))).0, "t.col >= ?");
        assert_eq!(rendered(&apply(Operator::LessThan, json!(1))).0, "t.col < ?");
        assert_eq!(rendered(&apply(Operator::GreaterThan, json!(1))).0, "t.col > ?");
    }

    #[test]
    fn test_equal_null_becomes_is_null() {
        assert_eq!(rendered(&apply(Operator::Equal, Value::Null)).0, "t.col IS NULL");
        assert_eq!(rendered(&apply(Operator::NotEqual, Value::Null)).0, "t.col IS NOT NULL");
    }

    #[test]
    fn test_null_checks_ignore_value() {
        assert_eq!(rendered(&apply(Operator::IsNull, json!("x"))).0, "t.col IS NULL");
        assert_eq!(rendered(&apply(Operator::IsNotNull, Value::Null)).0, "t.col IS NOT NULL");
    }

    #[test]
    fn test_like_escaping() {
        let (sql, values) = rendered(&apply(Operator::Like, json!("50%_off*")));
        assert_eq!(sql, "t.col LIKE ? ESCAPE '*'");
        assert_eq!(values, vec![json!("%50*%*_off**%")]);
    }

    #[test]
    fn test_ilike_variants() {
        let (sql, values) = rendered(&apply(Operator::Ilike, json!("ab_c")));
        assert_eq!(sql, "UPPER(t.col) LIKE ? ESCAPE '*'");
        assert_eq!(values, vec![json!("%AB*_C%")]);

        let (_, values) = rendered(&apply(Operator::IlikeStart, json!("ab")));
        assert_eq!(values, vec![json!("AB%")]);
    }

    #[test]
    fn test_between_goes_to_statement() {
        let sink = apply(Operator::Between, json!([1, 5]));
        assert!(sink.expression.is_empty());
        let fragment = sink.statement[0].to_fragment();
        assert_eq!(fragment.sql, "t.col BETWEEN ? AND ?");
        assert_eq!(fragment.values, vec![json!(1), json!(5)]);

        let mut sink = PredicateSink::new();
        let err = Operator::Between.apply(&mut sink, "t.col", &json!([1]), "range");
        assert!(matches!(err, Err(QueryError::InvalidCriterionValue { .. })));
    }

    #[test]
    fn test_in_lists() {
        assert_eq!(rendered(&apply(Operator::In, json!([1, 2]))).0, "t.col IN (?, ?)");
        assert_eq!(rendered(&apply(Operator::NotIn, json!([1]))).0, "t.col NOT IN (?)");
        assert_eq!(rendered(&apply(Operator::In, json!([]))).0, "1 = 0");
        assert_eq!(rendered(&apply(Operator::NotIn, json!([]))).0, "1 = 1");
    }

    #[test]
    fn test_has_is_unsupported() {
        let mut sink = PredicateSink::new();
        let err = Operator::Has.apply(&mut sink, "t.col", &json!(1), "p");
        assert!(matches!(err, Err(QueryError::UnsupportedOperator(name)) if name == "HAS"));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_serde_names() {
        let op: Operator = serde_json::from_value(json!("ILIKE_START")).unwrap();
        assert_eq!(op, Operator::IlikeStart);
        assert_eq!(serde_json::to_value(Operator::NotIn).unwrap(), json!("NOT_IN"));
    }
}
