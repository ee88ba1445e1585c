//! Projection compilation.
//!
//! A [`Compilation`] owns the join plan and query pair of one query. Projection
//! leaves, sorts and criteria all resolve their paths through it, so each
//! association is joined once no matter who asks for it first.

use crate::builder::{Condition, JoinType};
use crate::dialect::{Dialect, Functions};
use crate::error::{QueryError, Result};
use crate::materialize::{FieldHandler, Middleware};
use crate::plan::{prefixed, JoinMode, JoinPlan, ResolvedPath, ScopedPredicate, ID_SEGMENT};
use crate::projection::{Function, Leaf, NestedList, Projection, Sort};
use crate::query::QueryPair;
use crate::schema::{EntityMetadata, Schema, SqlType};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::trace;

/// Request criteria by name, consumed while compiling
pub type CriteriaPool = Map<String, Value>;

/// Tells the compiler which entities have a cache-enabled model
pub trait ModelCatalog {
    fn is_cached(&self, entity: &str) -> bool;
}

impl ModelCatalog for HashSet<String> {
    fn is_cached(&self, entity: &str) -> bool {
        self.contains(entity)
    }
}

impl<const N: usize> ModelCatalog for [&str; N] {
    fn is_cached(&self, entity: &str) -> bool {
        self.iter().any(|name| *name == entity)
    }
}

/// A nested list resolved after the parent rows are loaded
#[derive(Debug, Clone)]
pub struct NestedTask {
    /// Association path from the root, prefixed
    pub path: String,
    /// Prefix of the projection that owns the list; its `$id` scopes the sub-query
    pub parent: String,
    pub list: NestedList,
    /// Value bag of the nested list's criteria, taken from the request
    pub criteria: Option<Value>,
    /// Request criteria left when the task was registered
    pub pool: CriteriaPool,
}

/// Everything needed to execute and materialize a compiled query
pub struct CompiledQuery {
    pub entity: String,
    pub query: QueryPair,
    pub handlers: Vec<FieldHandler>,
    pub nested: Vec<NestedTask>,
    /// Entities whose cached lists feed `FieldHandler::Denormalize`, by index
    pub dependencies: Vec<String>,
    pub middlewares: Vec<Middleware>,
    pub grouped: bool,
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("entity", &self.entity)
            .field("query", &self.query)
            .field("handlers", &self.handlers)
            .field("nested", &self.nested)
            .field("dependencies", &self.dependencies)
            .field("middlewares", &self.middlewares.len())
            .field("grouped", &self.grouped)
            .finish()
    }
}

/// State of one query compilation
pub struct Compilation<'a> {
    schema: &'a Schema,
    root: &'a EntityMetadata,
    catalog: &'a dyn ModelCatalog,
    dialect: Dialect,
    functions: &'static Functions,
    plan: JoinPlan,
    query: QueryPair,
    primitive_fields: Vec<String>,
    handlers: Vec<FieldHandler>,
    nested: Vec<NestedTask>,
    dependencies: Vec<String>,
    middlewares: Vec<Middleware>,
    grouped: bool,
}

impl<'a> Compilation<'a> {
    pub fn new(
        schema: &'a Schema,
        root: &'a EntityMetadata,
        dialect: Dialect,
        catalog: &'a dyn ModelCatalog,
    ) -> Self {
        let plan = JoinPlan::new(root);
        let mut query = QueryPair::new(&root.table, plan.root_alias());

        if let Some(column) = root.soft_delete_column() {
            query.and_where(Condition::is_null(format!("{}.{}", plan.root_alias(), column)));
        }

        Self {
            schema,
            root,
            catalog,
            dialect,
            functions: dialect.functions(),
            plan,
            query,
            primitive_fields: Vec::new(),
            handlers: Vec::new(),
            nested: Vec::new(),
            dependencies: Vec::new(),
            middlewares: Vec::new(),
            grouped: false,
        }
    }

    /// Compilation of one nested list, scoped to the parent row with id `parent_id`
    pub fn nested(
        schema: &'a Schema,
        root: &'a EntityMetadata,
        dialect: Dialect,
        catalog: &'a dyn ModelCatalog,
        task: &NestedTask,
        parent_id: &Value,
    ) -> Result<Self> {
        let mut compilation = Self::new(schema, root, dialect, catalog);
        let list = &task.list;

        compilation.resolve_with(&prefixed(&task.path, ID_SEGMENT), JoinMode::ForceInner, None)?;

        let mode = match list.join {
            JoinType::Inner => JoinMode::Inner,
            JoinType::Left => JoinMode::Left,
        };
        let mut pool = task.pool.clone();
        compilation.middlewares = list.projection.middlewares().to_vec();
        compilation.compile_projection(&list.projection, &mut pool, &task.path, true, mode)?;

        if let Some(sort) = &list.sort {
            compilation.apply_sort(sort, &task.path)?;
        }

        let parent = compilation.resolve(&prefixed(&task.parent, ID_SEGMENT), JoinMode::Left)?;
        compilation
            .query
            .and_where(Condition::eq(parent.column, parent_id.clone()));

        // nested criteria filter the child rows themselves
        if let (Some(criteria), Some(values)) = (&list.criteria, &task.criteria) {
            let grouped = compilation.grouped;
            compilation.grouped = false;
            criteria.spec.apply(&mut compilation, values, &task.path)?;
            compilation.grouped = grouped;
        }

        Ok(compilation)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn functions(&self) -> &'static Functions {
        self.functions
    }

    pub fn query(&self) -> &QueryPair {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut QueryPair {
        &mut self.query
    }

    pub fn plan(&self) -> &JoinPlan {
        &self.plan
    }

    pub fn is_grouped(&self) -> bool {
        self.grouped
    }

    pub fn set_grouped(&mut self, grouped: bool) {
        self.grouped = grouped;
    }

    /// Resolve a path against the root entity
    pub fn resolve(&mut self, path: &str, mode: JoinMode) -> Result<ResolvedPath> {
        self.resolve_with(path, mode, None)
    }

    fn resolve_with(
        &mut self,
        path: &str,
        mode: JoinMode,
        scoped: Option<&mut ScopedPredicate>,
    ) -> Result<ResolvedPath> {
        self.plan
            .resolve(self.schema, self.root, &mut self.query, path, mode, scoped)
    }

    /// Compile the top-level projection of a request
    pub fn projection(&mut self, projection: &Projection, pool: &mut CriteriaPool) -> Result<bool> {
        self.middlewares = projection.middlewares().to_vec();
        self.compile_projection(projection, pool, "", false, JoinMode::Left)
    }

    /// Add the fields of `projection` under `prefix`; returns whether the query is grouped
    pub fn compile_projection(
        &mut self,
        projection: &Projection,
        pool: &mut CriteriaPool,
        prefix: &str,
        grouped: bool,
        mode: JoinMode,
    ) -> Result<bool> {
        let mut grouped = grouped;

        for (path, leaf) in projection.fields() {
            let path = prefixed(prefix, path);

            match leaf {
                Leaf::List(list) => {
                    let criteria = list
                        .criteria
                        .as_ref()
                        .and_then(|criteria| pool.remove(&criteria.name));
                    trace!(path = %path, key = %list.output_key, "deferred nested list");
                    self.nested.push(NestedTask {
                        path,
                        parent: prefix.to_string(),
                        list: list.clone(),
                        criteria,
                        pool: pool.clone(),
                    });
                }
                Leaf::Field(field) => {
                    let mut scoped = field.criteria.as_ref().and_then(|scoped| {
                        let value = pool.get(&scoped.criterion)?.get(&scoped.parameter)?;
                        Some(ScopedPredicate::new(
                            prefixed(prefix, &scoped.path),
                            scoped.operator,
                            value.clone(),
                            &scoped.parameter,
                        ))
                    });

                    let field_mode = match field.join {
                        JoinType::Inner => JoinMode::ForceInner,
                        JoinType::Left => mode,
                    };
                    let resolved = self.resolve_with(&path, field_mode, scoped.as_mut())?;

                    if let (Some(predicate), Some(criteria)) = (&scoped, &field.criteria) {
                        if predicate.applied {
                            pool.remove(&criteria.criterion);
                        }
                    }

                    match &field.function {
                        Some(function) => {
                            let expression = function.render(self.functions, &resolved.column);
                            self.query.field(expression, &field.alias);
                            if function.is_aggregate() {
                                grouped = true;
                            } else {
                                self.add_primitive(&resolved.column);
                            }
                            let sql_type = match function {
                                Function::Count => Some(SqlType::BigInt),
                                Function::GroupConcat => None,
                                _ => resolved.sql_type.clone(),
                            };
                            self.add_handler(&field.alias, sql_type);
                        }
                        None => {
                            self.query.field(&resolved.column, &field.alias);
                            self.add_primitive(&resolved.column);
                            self.add_handler(&field.alias, resolved.sql_type.clone());
                        }
                    }
                }
                Leaf::Column(alias) => {
                    let resolved = self.resolve(&path, mode)?;

                    if resolved.is_association_tail {
                        if !self.catalog.is_cached(&resolved.entity) {
                            return Err(QueryError::UngroupedToManyWithoutCache(path));
                        }
                        let dependency = self.dependency(&resolved.entity);
                        self.query
                            .field(self.functions.group_concat(&resolved.column), alias);
                        self.handlers.push(FieldHandler::Denormalize {
                            alias: alias.clone(),
                            dependency,
                        });
                        if alias.contains('.') {
                            self.handlers.push(FieldHandler::Unflatten {
                                alias: alias.clone(),
                                sql_type: None,
                            });
                        }
                        grouped = true;
                    } else {
                        self.query.field(&resolved.column, alias);
                        self.add_primitive(&resolved.column);
                        self.add_handler(alias, resolved.sql_type);
                    }
                }
            }
        }

        let pk = self.resolve(&prefixed(prefix, ID_SEGMENT), mode)?;
        self.query.field(&pk.column, ID_SEGMENT);
        self.add_primitive(&pk.column);

        if grouped {
            for field in &self.primitive_fields {
                self.query.group_by(field);
            }
        }

        self.grouped |= grouped;
        Ok(grouped)
    }

    /// Add ORDER BY terms; resolved paths are taken under `prefix`
    pub fn apply_sort(&mut self, sort: &Sort, prefix: &str) -> Result<()> {
        match sort {
            Sort::Random => {
                self.query.order_by(self.functions.random(), None);
            }
            Sort::Fields(fields) => {
                for field in fields {
                    let expression = if field.raw {
                        self.dialect.quote(&field.path)
                    } else {
                        self.resolve(&prefixed(prefix, &field.path), JoinMode::Left)?.column
                    };
                    self.query.order_by(expression, Some(field.direction));
                }
            }
        }
        Ok(())
    }

    fn add_primitive(&mut self, column: &str) {
        if !self.primitive_fields.iter().any(|f| f == column) {
            self.primitive_fields.push(column.to_string());
        }
    }

    fn add_handler(&mut self, alias: &str, sql_type: Option<SqlType>) {
        if let Some(handler) = FieldHandler::for_column(alias, sql_type) {
            self.handlers.push(handler);
        }
    }

    fn dependency(&mut self, entity: &str) -> usize {
        match self.dependencies.iter().position(|d| d == entity) {
            Some(index) => index,
            None => {
                self.dependencies.push(entity.to_string());
                self.dependencies.len() - 1
            }
        }
    }

    pub fn finish(self) -> CompiledQuery {
        CompiledQuery {
            entity: self.root.name.clone(),
            query: self.query,
            handlers: self.handlers,
            nested: self.nested,
            dependencies: self.dependencies,
            middlewares: self.middlewares,
            grouped: self.grouped,
        }
    }
}
