//! SQL assembly.
//!
//! `SelectBuilder` accumulates the pieces of a SELECT statement and renders them
//! into a [`Statement`]: SQL text plus positionally bound values. Conditions carry
//! their values with them and use `?` as the placeholder marker; the marker is
//! rewritten to the dialect's placeholder when the statement is built.

use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use chrono::NaiveDateTime;
use serde_json::Value;
use std::fmt;

/// Date format used when binding dates
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Comparison operators for WHERE clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "="),
            ComparisonOp::Ne => write!(f, "<>"),
            ComparisonOp::Lt => write!(f, "<"),
            ComparisonOp::Le => write!(f, "<="),
            ComparisonOp::Gt => write!(f, ">"),
            ComparisonOp::Ge => write!(f, ">="),
            ComparisonOp::Like => write!(f, "LIKE"),
            ComparisonOp::NotLike => write!(f, "NOT LIKE"),
            ComparisonOp::In => write!(f, "IN"),
            ComparisonOp::NotIn => write!(f, "NOT IN"),
            ComparisonOp::IsNull => write!(f, "IS NULL"),
            ComparisonOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicalOp {
    #[default]
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    Inner,
    #[default]
    Left,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
        }
    }
}

/// A SQL fragment with `?` markers and the values bound to them, in order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    pub sql: String,
    pub values: Vec<Value>,
}

/// WHERE / HAVING / ON condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Simple {
        column: String,
        op: ComparisonOp,
        value: Option<Value>,
    },
    Compound {
        conditions: Vec<Condition>,
        op: LogicalOp,
    },
    /// Literal SQL with `?` markers
    Raw { sql: String, values: Vec<Value> },
    /// Always-true / always-false predicate
    Constant(bool),
}

impl Condition {
    pub fn simple(column: impl Into<String>, op: ComparisonOp, value: Value) -> Self {
        Condition::Simple {
            column: column.into(),
            op,
            value: Some(value),
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::simple(column, ComparisonOp::Eq, value)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::Simple {
            column: column.into(),
            op: ComparisonOp::IsNull,
            value: None,
        }
    }

    /// Equality between two column references
    pub fn columns_eq(left: impl AsRef<str>, right: impl AsRef<str>) -> Self {
        Condition::raw(format!("{} = {}", left.as_ref(), right.as_ref()))
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Condition::Raw {
            sql: sql.into(),
            values: Vec::new(),
        }
    }

    pub fn raw_with(sql: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::Raw {
            sql: sql.into(),
            values,
        }
    }

    /// Combine conditions; a single condition is returned unchanged
    pub fn combine(mut conditions: Vec<Condition>, op: LogicalOp) -> Self {
        if conditions.len() == 1 {
            conditions.remove(0)
        } else {
            Condition::Compound { conditions, op }
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::combine(conditions, LogicalOp::And)
    }

    /// Render into a fragment with `?` markers
    pub fn to_fragment(&self) -> Fragment {
        let mut fragment = Fragment::default();
        self.write(&mut fragment);
        fragment
    }

    fn write(&self, out: &mut Fragment) {
        match self {
            Condition::Simple { column, op, value } => match op {
                ComparisonOp::IsNull | ComparisonOp::IsNotNull => {
                    out.sql.push_str(&format!("{} {}", column, op));
                }
                ComparisonOp::In | ComparisonOp::NotIn => {
                    let items = match value {
                        Some(Value::Array(items)) => items.clone(),
                        Some(Value::Null) | None => Vec::new(),
                        Some(other) => vec![other.clone()],
                    };
                    if items.is_empty() {
                        Condition::Constant(*op == ComparisonOp::NotIn).write(out);
                    } else {
                        let markers = vec!["?"; items.len()].join(", ");
                        out.sql.push_str(&format!("{} {} ({})", column, op, markers));
                        out.values.extend(items.into_iter().map(bind_value));
                    }
                }
                _ => match value {
                    Some(Value::Null) | None => {
                        out.sql.push_str(&format!("{} {} NULL", column, op));
                    }
                    Some(value) => {
                        out.sql.push_str(&format!("{} {} ?", column, op));
                        out.values.push(bind_value(value.clone()));
                    }
                },
            },
            Condition::Compound { conditions, op } => {
                if conditions.is_empty() {
                    Condition::Constant(true).write(out);
                } else {
                    out.sql.push('(');
                    for (index, condition) in conditions.iter().enumerate() {
                        if index > 0 {
                            out.sql.push_str(&format!(" {} ", op));
                        }
                        condition.write(out);
                    }
                    out.sql.push(')');
                }
            }
            Condition::Raw { sql, values } => {
                out.sql.push_str(sql);
                out.values.extend(values.iter().cloned().map(bind_value));
            }
            Condition::Constant(true) => out.sql.push_str("1 = 1"),
            Condition::Constant(false) => out.sql.push_str("1 = 0"),
        }
    }
}

/// Selected field
#[derive(Debug, Clone)]
pub struct Field {
    pub expression: String,
    pub alias: Option<String>,
}

/// Join clause
#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub alias: String,
    pub on_condition: Condition,
}

impl Join {
    fn write(&self, dialect: Dialect, out: &mut Fragment) {
        out.sql.push_str(&format!(
            " {} {} AS {} ON ",
            self.join_type,
            dialect.quote(&self.table),
            self.alias
        ));
        self.on_condition.write(out);
    }
}

/// ORDER BY clause; a missing direction is used for expressions such as random order
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub expression: String,
    pub direction: Option<SortDirection>,
}

impl OrderBy {
    pub fn to_sql(&self) -> String {
        match self.direction {
            Some(direction) => format!("{} {}", self.expression, direction),
            None => self.expression.clone(),
        }
    }
}

/// A rendered statement ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    /// Rewrite `?` markers into dialect placeholders, skipping quoted text
    pub fn new(fragment: Fragment, dialect: Dialect) -> Self {
        let mut sql = String::with_capacity(fragment.sql.len());
        let mut index = 0;
        let mut quote: Option<char> = None;

        for c in fragment.sql.chars() {
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => {}
                None if c == '\'' || c == '"' || c == '`' => quote = Some(c),
                None if c == '?' => {
                    index += 1;
                    sql.push_str(&dialect.placeholder(index));
                    continue;
                }
                None => {}
            }
            sql.push(c);
        }

        Self {
            sql,
            params: fragment.values,
        }
    }
}

/// SELECT query builder
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: String,
    alias: String,
    fields: Vec<Field>,
    joins: Vec<Join>,
    where_clause: Option<Condition>,
    group_by: Vec<String>,
    having: Option<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectBuilder {
    /// Create a new SELECT query builder over `table AS alias`
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
            fields: Vec::new(),
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Add a selected expression with an optional output alias
    pub fn field(&mut self, expression: impl Into<String>, alias: Option<&str>) -> &mut Self {
        self.fields.push(Field {
            expression: expression.into(),
            alias: alias.map(String::from),
        });
        self
    }

    /// Add an AND condition to existing WHERE
    pub fn and_where(&mut self, condition: Condition) -> &mut Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => append(existing, condition, LogicalOp::And),
            None => condition,
        });
        self
    }

    /// Add a JOIN clause
    pub fn join(
        &mut self,
        join_type: JoinType,
        table: impl Into<String>,
        alias: impl Into<String>,
        on: Condition,
    ) -> &mut Self {
        self.joins.push(Join {
            join_type,
            table: table.into(),
            alias: alias.into(),
            on_condition: on,
        });
        self
    }

    /// Add a GROUP BY expression, ignoring duplicates
    pub fn group_by(&mut self, expression: impl Into<String>) -> &mut Self {
        let expression = expression.into();
        if !self.group_by.contains(&expression) {
            self.group_by.push(expression);
        }
        self
    }

    /// Add an AND condition to existing HAVING
    pub fn having(&mut self, condition: Condition) -> &mut Self {
        self.having = Some(match self.having.take() {
            Some(existing) => append(existing, condition, LogicalOp::And),
            None => condition,
        });
        self
    }

    /// Add ORDER BY
    pub fn order_by(
        &mut self,
        expression: impl Into<String>,
        direction: Option<SortDirection>,
    ) -> &mut Self {
        self.order_by.push(OrderBy {
            expression: expression.into(),
            direction,
        });
        self
    }

    /// Set LIMIT
    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET
    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.offset = Some(offset);
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn group_by_columns(&self) -> &[String] {
        &self.group_by
    }

    pub fn where_condition(&self) -> Option<&Condition> {
        self.where_clause.as_ref()
    }

    pub fn having_condition(&self) -> Option<&Condition> {
        self.having.as_ref()
    }

    /// Render the statement with `?` markers
    pub fn to_fragment(&self, dialect: Dialect) -> Result<Fragment> {
        if self.fields.is_empty() {
            return Err(QueryError::Schema(format!(
                "SELECT over {} has no fields",
                self.table
            )));
        }

        let mut out = Fragment::default();
        out.sql.push_str("SELECT ");

        let fields = self
            .fields
            .iter()
            .map(|field| match &field.alias {
                Some(alias) => format!("{} AS {}", field.expression, dialect.quote(alias)),
                None => field.expression.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        out.sql.push_str(&fields);
        out.sql.push_str(&format!(
            " FROM {} AS {}",
            dialect.quote(&self.table),
            self.alias
        ));

        for join in &self.joins {
            join.write(dialect, &mut out);
        }

        if let Some(where_clause) = &self.where_clause {
            out.sql.push_str(" WHERE ");
            where_clause.write(&mut out);
        }

        if !self.group_by.is_empty() {
            out.sql.push_str(" GROUP BY ");
            out.sql.push_str(&self.group_by.join(", "));
        }

        if let Some(having) = &self.having {
            out.sql.push_str(" HAVING ");
            having.write(&mut out);
        }

        if !self.order_by.is_empty() {
            out.sql.push_str(" ORDER BY ");
            out.sql.push_str(
                &self
                    .order_by
                    .iter()
                    .map(|o| o.to_sql())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        if let Some(limit) = self.limit {
            out.sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = self.offset {
            out.sql.push_str(&format!(" OFFSET {}", offset));
        }

        Ok(out)
    }

    /// Build the statement for the given dialect
    pub fn build(&self, dialect: Dialect) -> Result<Statement> {
        Ok(Statement::new(self.to_fragment(dialect)?, dialect))
    }
}

fn append(existing: Condition, condition: Condition, op: LogicalOp) -> Condition {
    match existing {
        Condition::Compound {
            mut conditions,
            op: existing_op,
        } if existing_op == op => {
            conditions.push(condition);
            Condition::Compound { conditions, op }
        }
        existing => Condition::Compound {
            conditions: vec![existing, condition],
            op,
        },
    }
}

/// Normalize a value before binding: nested arrays and objects travel as JSON text
fn bind_value(value: Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other,
    }
}

/// Serialize a date the way the database expects it (`YYYY-MM-DD HH:MM:SS`)
pub fn datetime_value(datetime: &NaiveDateTime) -> Value {
    Value::String(datetime.format(DATETIME_FORMAT).to_string())
}
