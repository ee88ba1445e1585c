//! Projection and sort definitions.
//!
//! A projection maps source paths to output aliases. Leaves are plain columns,
//! function columns, or nested lists resolved by a sub-query per parent row.

use crate::builder::{JoinType, SortDirection};
use crate::criteria::CriteriaSpec;
use crate::dialect::Functions;
use crate::materialize::{Middleware, Record};
use crate::operators::Operator;
use std::fmt;
use std::sync::Arc;

/// Function applied to a selected column
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    Count,
    Sum,
    GroupConcat,
    /// Character set conversion; does not aggregate
    Convert { charset: Option<String> },
}

impl Function {
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, Function::Convert { .. })
    }

    pub fn render(&self, functions: &Functions, column: &str) -> String {
        match self {
            Function::Count => functions.count(column),
            Function::Sum => functions.sum(column),
            Function::GroupConcat => functions.group_concat(column),
            Function::Convert { charset } => functions.convert(column, charset.as_deref()),
        }
    }
}

/// A predicate scoped to the join of the leaf's association.
///
/// The value comes from parameter `parameter` of the request's `criterion` bag,
/// and the bag is consumed so the criterion is not applied again.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedCriterion {
    pub criterion: String,
    pub parameter: String,
    pub path: String,
    pub operator: Operator,
}

impl ScopedCriterion {
    pub fn new(criterion: &str, parameter: &str, path: &str, operator: Operator) -> Self {
        Self {
            criterion: criterion.to_string(),
            parameter: parameter.to_string(),
            path: path.to_string(),
            operator,
        }
    }
}

/// A selected column with options
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLeaf {
    pub alias: String,
    pub function: Option<Function>,
    pub join: JoinType,
    pub criteria: Option<ScopedCriterion>,
}

impl FieldLeaf {
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            function: None,
            join: JoinType::Left,
            criteria: None,
        }
    }

    pub fn function(mut self, function: Function) -> Self {
        self.function = Some(function);
        self
    }

    /// Join every hop of the path with INNER joins
    pub fn inner(mut self) -> Self {
        self.join = JoinType::Inner;
        self
    }

    pub fn scoped(mut self, criterion: ScopedCriterion) -> Self {
        self.criteria = Some(criterion);
        self
    }
}

/// Named criteria applied inside every nested sub-query
#[derive(Debug, Clone)]
pub struct NestedCriteria {
    pub name: String,
    pub spec: CriteriaSpec,
}

/// A to-many association materialized as a list under `output_key`
#[derive(Debug, Clone)]
pub struct NestedList {
    pub output_key: String,
    pub projection: Arc<Projection>,
    pub sort: Option<Sort>,
    pub criteria: Option<NestedCriteria>,
    pub join: JoinType,
}

impl NestedList {
    pub fn new(output_key: &str, projection: Projection) -> Self {
        Self {
            output_key: output_key.to_string(),
            projection: Arc::new(projection),
            sort: None,
            criteria: None,
            join: JoinType::Inner,
        }
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn criteria(mut self, name: &str, spec: CriteriaSpec) -> Self {
        self.criteria = Some(NestedCriteria {
            name: name.to_string(),
            spec,
        });
        self
    }

    /// Keep nested rows whose own associations are missing
    pub fn left(mut self) -> Self {
        self.join = JoinType::Left;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Leaf {
    Column(String),
    Field(FieldLeaf),
    List(NestedList),
}

/// Ordered mapping of source paths to output leaves
#[derive(Clone, Default)]
pub struct Projection {
    fields: Vec<(String, Leaf)>,
    middlewares: Vec<Middleware>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select `path` under `alias`
    pub fn column(mut self, path: &str, alias: &str) -> Self {
        self.fields.push((path.to_string(), Leaf::Column(alias.to_string())));
        self
    }

    pub fn field(mut self, path: &str, leaf: FieldLeaf) -> Self {
        self.fields.push((path.to_string(), Leaf::Field(leaf)));
        self
    }

    pub fn list(mut self, path: &str, list: NestedList) -> Self {
        self.fields.push((path.to_string(), Leaf::List(list)));
        self
    }

    /// Register a transform run on every materialized row
    pub fn use_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(&mut Record) + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn fields(&self) -> &[(String, Leaf)] {
        &self.fields
    }

    pub fn middlewares(&self) -> &[Middleware] {
        &self.middlewares
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("fields", &self.fields)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

/// One ORDER BY term
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub path: String,
    pub direction: SortDirection,
    /// Order by the output alias instead of a resolved path
    pub raw: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sort {
    Random,
    Fields(Vec<SortField>),
}

impl Sort {
    pub fn asc(path: &str) -> Self {
        Sort::Fields(Vec::new()).then(path, SortDirection::Asc)
    }

    pub fn desc(path: &str) -> Self {
        Sort::Fields(Vec::new()).then(path, SortDirection::Desc)
    }

    /// Append a resolved term
    pub fn then(self, path: &str, direction: SortDirection) -> Self {
        self.push(SortField {
            path: path.to_string(),
            direction,
            raw: false,
        })
    }

    /// Append a term ordering by an output alias
    pub fn raw(self, alias: &str, direction: SortDirection) -> Self {
        self.push(SortField {
            path: alias.to_string(),
            direction,
            raw: true,
        })
    }

    fn push(self, field: SortField) -> Self {
        match self {
            Sort::Random => Sort::Fields(vec![field]),
            Sort::Fields(mut fields) => {
                fields.push(field);
                Sort::Fields(fields)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use serde_json::json;

    #[test]
    fn test_function_rendering() {
        let functions = Dialect::MySql.functions();
        assert_eq!(Function::Count.render(functions, "t.id"), "COUNT(t.id)");
        assert_eq!(Function::GroupConcat.render(functions, "t.id"), "GROUP_CONCAT(t.id)");
        assert_eq!(
            Function::Convert { charset: Some("latin1".into()) }.render(functions, "t.body"),
            "CONVERT(t.body USING latin1)"
        );
        assert!(Function::Sum.is_aggregate());
        assert!(!Function::Convert { charset: None }.is_aggregate());
    }

    #[test]
    fn test_projection_keeps_order() {
        let projection = Projection::new()
            .column("title", "title")
            .field("comments.$id", FieldLeaf::new("comments").function(Function::Count))
            .list(
                "comments",
                NestedList::new("commentList", Projection::new().column("text", "text")),
            )
            .use_middleware(|record| {
                record.insert("seen".into(), json!(true));
            });

        let paths: Vec<&str> = projection.fields().iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["title", "comments.$id", "comments"]);
        assert_eq!(projection.middlewares().len(), 1);
        assert!(format!("{:?}", projection).contains("middlewares: 1"));
    }

    #[test]
    fn test_sort_builders() {
        let sort = Sort::desc("views").raw("title", SortDirection::Asc);
        match sort {
            Sort::Fields(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].direction, SortDirection::Desc);
                assert!(fields[1].raw);
            }
            Sort::Random => panic!("expected fields"),
        }
        assert_eq!(Sort::Random.then("id", SortDirection::Asc), Sort::asc("id"));
    }
}
