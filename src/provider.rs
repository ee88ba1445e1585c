//! Query orchestration.
//!
//! A [`Provider`] owns the schema, the execution backend and every registered
//! model with its cache. Each operation compiles a request synchronously, then
//! executes the resulting statements and materializes the rows.

use crate::backend::{DatabaseBackend, QueryResult};
use crate::builder::Statement;
use crate::cache::ModelCache;
use crate::compiler::{Compilation, CompiledQuery, NestedTask};
use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use crate::materialize::{run_middlewares, EntityIndex, Record};
use crate::model::{Model, QueryRequest, COUNT_PROJECTION, DEFAULT_PROJECTION};
use crate::plan::ID_SEGMENT;
use crate::query::{ListResult, COUNT_COLUMN};
use crate::schema::Schema;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Configuration for a provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Projection used when a request names none
    pub default_projection: String,
    /// Whether cache-enabled models may serve lists from their cache
    pub use_cache: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_projection: DEFAULT_PROJECTION.to_string(),
            use_cache: true,
        }
    }
}

struct RegisteredModel {
    model: Model,
    cache: Option<ModelCache>,
}

struct Inner<B> {
    schema: Schema,
    backend: B,
    config: ProviderConfig,
    dialect: Dialect,
    models: HashMap<String, RegisteredModel>,
    cached: HashSet<String>,
}

/// Entry point for executing model queries
pub struct Provider<B: DatabaseBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: DatabaseBackend> Clone for Provider<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Collects models before the provider is assembled
pub struct ProviderBuilder<B> {
    schema: Schema,
    backend: B,
    config: ProviderConfig,
    models: Vec<Model>,
}

impl<B: DatabaseBackend> ProviderBuilder<B> {
    pub fn config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    /// Validate the schema and every model's entity, then assemble the provider
    pub fn build(self) -> Result<Provider<B>> {
        self.schema.validate()?;

        let mut models = HashMap::new();
        let mut cached = HashSet::new();

        for model in self.models {
            let name = model.entity().to_string();
            self.schema.entity(&name)?;

            if models.contains_key(&name) {
                return Err(QueryError::Schema(format!("Model {} registered twice", name)));
            }

            let cache = model.cache_timeout().map(ModelCache::new);
            if cache.is_some() {
                cached.insert(name.clone());
            }
            models.insert(name, RegisteredModel { model, cache });
        }

        let dialect = self.backend.dialect();
        info!(
            dialect = %dialect,
            models = models.len(),
            cached = cached.len(),
            "provider ready"
        );

        Ok(Provider {
            inner: Arc::new(Inner {
                schema: self.schema,
                backend: self.backend,
                config: self.config,
                dialect,
                models,
                cached,
            }),
        })
    }
}

impl<B: DatabaseBackend> Provider<B> {
    pub fn builder(schema: Schema, backend: B) -> ProviderBuilder<B> {
        ProviderBuilder {
            schema,
            backend,
            config: ProviderConfig::default(),
            models: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    pub fn model(&self, name: &str) -> Result<&Model> {
        self.registered(name).map(|registered| &registered.model)
    }

    fn registered(&self, name: &str) -> Result<&RegisteredModel> {
        self.inner
            .models
            .get(name)
            .ok_or_else(|| QueryError::UnknownModel(name.to_string()))
    }

    /// Compile a request into its statements and materialization plan without executing it
    pub fn compile(&self, model: &str, request: &QueryRequest) -> Result<CompiledQuery> {
        let model = &self.registered(model)?.model;
        let schema = &self.inner.schema;
        let root = schema.entity(model.entity())?;

        let projection_name = request
            .projection
            .as_deref()
            .unwrap_or(&self.inner.config.default_projection);
        let projection = model.get_projection(projection_name)?;

        let mut compilation =
            Compilation::new(schema, root, self.inner.dialect, &self.inner.cached);
        let mut pool = request.criteria.clone();
        compilation.projection(projection, &mut pool)?;

        for name in request.sort_names() {
            compilation.apply_sort(model.get_sort(name)?, "")?;
        }

        for (name, values) in &pool {
            if values.is_null() {
                continue;
            }
            model.get_criteria(name)?.apply(&mut compilation, values, "")?;
        }

        if let Some(page) = request.page_params()? {
            compilation.query_mut().page(page);
        }

        let compiled = compilation.finish();
        self.check_nested(&compiled.entity, &compiled.nested)?;
        Ok(compiled)
    }

    /// Compile nested lists against a null parent id, recursively
    fn check_nested(&self, entity: &str, tasks: &[NestedTask]) -> Result<()> {
        for task in tasks {
            let compiled = self.compile_nested(entity, task, &Value::Null)?;
            compiled.query.select_statement(self.inner.dialect)?;
            self.check_nested(entity, &compiled.nested)?;
        }
        Ok(())
    }

    fn compile_nested(
        &self,
        entity: &str,
        task: &NestedTask,
        parent_id: &Value,
    ) -> Result<CompiledQuery> {
        let schema = &self.inner.schema;
        let root = schema.entity(entity)?;
        let compilation = Compilation::nested(
            schema,
            root,
            self.inner.dialect,
            &self.inner.cached,
            task,
            parent_id,
        )?;
        Ok(compilation.finish())
    }

    async fn fetch(&self, statement: &Statement) -> Result<QueryResult> {
        debug!(sql = %statement.sql, params = statement.params.len(), "executing statement");
        self.inner
            .backend
            .query(&statement.sql, &statement.params)
            .await
    }

    async fn fetch_count(&self, statement: &Statement) -> Result<u64> {
        let rows = self.fetch(statement).await?;
        rows.first()
            .and_then(|row| row.get_i64(COUNT_COLUMN))
            .map(|count| count.max(0) as u64)
            .ok_or_else(|| QueryError::Database("Count statement returned no count".to_string()))
    }

    /// Full lists of the cached sibling models a query denormalizes from
    async fn load_dependencies(&self, entities: &[String]) -> Result<Vec<Arc<EntityIndex>>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        debug!(siblings = ?entities, "loading cached siblings");

        let lists = try_join_all(entities.iter().map(|entity| {
            let request = QueryRequest::new().projection(&self.inner.config.default_projection);
            self.list_boxed(entity.clone(), request)
        }))
        .await?;

        Ok(lists
            .iter()
            .map(|list| Arc::new(EntityIndex::from_records(list)))
            .collect())
    }

    /// Fetch rows and their sibling lists concurrently, then materialize
    fn execute<'a>(
        &'a self,
        compiled: &'a CompiledQuery,
        statement: Statement,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        async move {
            let (rows, dependencies) = tokio::try_join!(
                self.fetch(&statement),
                self.load_dependencies(&compiled.dependencies)
            )?;
            self.materialize(compiled, rows, &dependencies).await
        }
        .boxed()
    }

    async fn materialize(
        &self,
        compiled: &CompiledQuery,
        rows: QueryResult,
        dependencies: &[Arc<EntityIndex>],
    ) -> Result<Vec<Record>> {
        try_join_all(
            rows.into_iter()
                .map(|row| self.materialize_row(compiled, row.into_record(), dependencies)),
        )
        .await
    }

    /// Handlers, then nested lists, then middlewares
    async fn materialize_row(
        &self,
        compiled: &CompiledQuery,
        mut record: Record,
        dependencies: &[Arc<EntityIndex>],
    ) -> Result<Record> {
        for handler in &compiled.handlers {
            handler.apply(&mut record, dependencies);
        }

        if !compiled.nested.is_empty() {
            let parent_id = record.get(ID_SEGMENT).cloned().unwrap_or(Value::Null);
            let lists = try_join_all(
                compiled
                    .nested
                    .iter()
                    .map(|task| self.nested_list(&compiled.entity, task, parent_id.clone())),
            )
            .await?;

            for (task, list) in compiled.nested.iter().zip(lists) {
                let list = list.into_iter().map(Value::Object).collect();
                record.insert(task.list.output_key.clone(), Value::Array(list));
            }
        }

        run_middlewares(&mut record, &compiled.middlewares);
        Ok(record)
    }

    fn nested_list<'a>(
        &'a self,
        entity: &'a str,
        task: &'a NestedTask,
        parent_id: Value,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        async move {
            let compiled = self.compile_nested(entity, task, &parent_id)?;
            let statement = compiled.query.select_statement(self.inner.dialect)?;
            debug!(path = %task.path, parent = %parent_id, "nested list");
            self.execute(&compiled, statement).await
        }
        .boxed()
    }

    fn list_boxed(
        &self,
        model: String,
        request: QueryRequest,
    ) -> BoxFuture<'_, Result<Arc<Vec<Record>>>> {
        async move {
            let registered = self.registered(&model)?;
            let compiled = self.compile(&model, &request)?;
            let statement = compiled.query.select_statement(self.inner.dialect)?;

            let cache = registered.cache.as_ref().filter(|_| {
                self.inner.config.use_cache
                    && request.cached != Some(false)
                    && !request.has_criteria()
            });
            let Some(cache) = cache else {
                return Ok(Arc::new(self.execute(&compiled, statement).await?));
            };

            let key = request.cache_key(&self.inner.config.default_projection)?;
            if let Some(result) = cache.fresh(&key).await {
                debug!(model = %model, key = %key, "cache hit");
                return Ok(result);
            }

            let result = Arc::new(self.execute(&compiled, statement).await?);
            cache.replace(&key, result.clone()).await;
            Ok(result)
        }
        .boxed()
    }

    /// One page of rows with the total row count
    #[instrument(skip(self, request))]
    pub async fn request_list(&self, model: &str, request: QueryRequest) -> Result<ListResult> {
        let page = request
            .page_params()?
            .ok_or_else(|| QueryError::InvalidPageParameters("pageSize is required".to_string()))?;

        let compiled = self.compile(model, &request)?;
        let select = compiled.query.select_statement(self.inner.dialect)?;
        let count = compiled.query.count_statement(self.inner.dialect)?;

        let (list, count) = tokio::try_join!(
            self.execute(&compiled, select),
            self.fetch_count(&count)
        )?;

        Ok(ListResult {
            list,
            count,
            page: page.number,
            pages: page.pages(count),
        })
    }

    /// All matching rows; unfiltered lists of cached models are served from the cache
    #[instrument(skip(self, request))]
    pub async fn list(&self, model: &str, request: QueryRequest) -> Result<Arc<Vec<Record>>> {
        self.list_boxed(model.to_string(), request).await
    }

    /// Number of rows matching the request's criteria
    #[instrument(skip(self, request))]
    pub async fn count(&self, model: &str, request: QueryRequest) -> Result<u64> {
        let request = QueryRequest {
            projection: Some(COUNT_PROJECTION.to_string()),
            criteria: request.criteria,
            ..QueryRequest::default()
        };
        let compiled = self.compile(model, &request)?;
        self.fetch_count(&compiled.query.count_statement(self.inner.dialect)?)
            .await
    }

    /// The first matching row, if any
    #[instrument(skip(self, request))]
    pub async fn single(&self, model: &str, request: QueryRequest) -> Result<Option<Record>> {
        let compiled = self.compile(model, &request)?;
        let statement = compiled.query.single_statement(self.inner.dialect)?;
        let mut records = self.execute(&compiled, statement).await?;
        Ok(if records.is_empty() {
            None
        } else {
            Some(records.swap_remove(0))
        })
    }

    /// Lists of related models are not supported
    pub async fn request_related(&self, model: &str, _request: QueryRequest) -> Result<ListResult> {
        Err(QueryError::Unsupported(format!("request_related on {}", model)))
    }

    /// Drop the cached list of a model
    pub async fn invalidate(&self, model: &str) -> Result<()> {
        if let Some(cache) = &self.registered(model)?.cache {
            cache.invalidate().await;
            debug!(model, "cache invalidated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::criteria::CriteriaSpec;
    use crate::operators::Operator;
    use crate::plan::tests::blog_schema;
    use crate::projection::{FieldLeaf, Function, NestedList, Projection};
    use serde_json::json;
    use std::time::Duration;

    fn article_model() -> Model {
        Model::new("Article")
            .projection(
                "default",
                Projection::new()
                    .column("title", "title")
                    .column("views", "views")
                    .column("author.name", "author.name"),
            )
            .projection(
                "withComments",
                Projection::new()
                    .column("title", "title")
                    .list(
                        "comments",
                        NestedList::new("comments", Projection::new().column("text", "text")),
                    )
                    .use_middleware(|record| {
                        let count = record["comments"].as_array().map(Vec::len).unwrap_or(0);
                        record.insert("commentCount".into(), json!(count));
                    }),
            )
            .projection(
                "withTags",
                Projection::new().column("title", "title").column("tags", "tags"),
            )
            .criteria("id", CriteriaSpec::single("id", "id", Operator::Equal))
            .sort_multiple([("title", "title")])
    }

    fn provider(backend: MockBackend) -> Provider<MockBackend> {
        Provider::builder(blog_schema(), backend)
            .model(article_model())
            .model(
                Model::new("Tag")
                    .cached(Duration::from_secs(60))
                    .projection("default", Projection::new().column("name", "name")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_unknown_entity() {
        let result = Provider::builder(blog_schema(), MockBackend::new(Dialect::Sqlite))
            .model(Model::new("Page"))
            .build();
        assert!(matches!(result, Err(QueryError::UnknownEntity(name)) if name == "Page"));

        let result = Provider::builder(blog_schema(), MockBackend::new(Dialect::Sqlite))
            .model(Model::new("Tag"))
            .model(Model::new("Tag"))
            .build();
        assert!(matches!(result, Err(QueryError::Schema(_))));
    }

    #[test]
    fn test_compile_lookups() {
        let provider = provider(MockBackend::new(Dialect::Sqlite));

        let request = QueryRequest::new().projection("short");
        assert!(matches!(
            provider.compile("Article", &request),
            Err(QueryError::UnknownProjection(_))
        ));
        let request = QueryRequest::new().sort("views");
        assert!(matches!(provider.compile("Article", &request), Err(QueryError::UnknownSort(_))));
        let request = QueryRequest::new().criterion("title", json!({"title": "x"}));
        assert!(matches!(
            provider.compile("Article", &request),
            Err(QueryError::UnknownCriterion(_))
        ));
        assert!(matches!(
            provider.compile("Comment", &QueryRequest::new()),
            Err(QueryError::UnknownModel(_))
        ));

        let request = QueryRequest::new().criterion("title", Value::Null);
        assert!(provider.compile("Article", &request).is_ok());
    }

    #[test]
    fn test_compile_order() {
        let provider = provider(MockBackend::new(Dialect::Postgres));
        let request = QueryRequest::new()
            .criterion("id", json!({"id": 4}))
            .sort("-title")
            .page(2, 10);

        let compiled = provider.compile("Article", &request).unwrap();
        let statement = compiled.query.select_statement(Dialect::Postgres).unwrap();

        assert!(statement
            .sql
            .ends_with("WHERE article_1.id = $1 ORDER BY article_1.title DESC LIMIT 10 OFFSET 10"));
        assert_eq!(statement.params, vec![json!(4)]);
    }

    #[tokio::test]
    async fn test_request_list() {
        let backend = MockBackend::new(Dialect::Sqlite)
            .respond("COUNT(*)", vec![json!({"count": 11})])
            .respond(
                "SELECT",
                vec![json!({"title": "a", "views": "3", "author.name": "Ann", "$id": 1})],
            );
        let provider = provider(backend);

        let result = provider
            .request_list("Article", QueryRequest::new().page("3", "5"))
            .await
            .unwrap();

        assert_eq!(result.count, 11);
        assert_eq!(result.page, 3);
        assert_eq!(result.pages, 3);
        assert_eq!(
            Value::Object(result.list[0].clone()),
            json!({"title": "a", "views": 3, "author": {"name": "Ann"}, "$id": 1})
        );

        let statements = provider.backend().statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(provider.backend().statements_like("LIMIT 5 OFFSET 10").len(), 1);
    }

    #[tokio::test]
    async fn test_request_list_validates_page_first() {
        let provider = provider(MockBackend::new(Dialect::Sqlite));

        let err = provider.request_list("Article", QueryRequest::new()).await;
        assert!(matches!(err, Err(QueryError::InvalidPageParameters(_))));
        let err = provider
            .request_list("Article", QueryRequest::new().page("x", 5))
            .await;
        assert!(matches!(err, Err(QueryError::InvalidPageParameters(_))));
        assert!(provider.backend().statements().is_empty());
    }

    #[tokio::test]
    async fn test_single_and_count() {
        let backend = MockBackend::new(Dialect::Sqlite)
            .respond("COUNT(*)", vec![json!({"count": "2"})])
            .respond(
                "SELECT",
                vec![json!({"title": "a", "$id": 1}), json!({"title": "b", "$id": 2})],
            );
        let provider = provider(backend);

        let record = provider.single("Article", QueryRequest::new()).await.unwrap();
        assert_eq!(record.unwrap()["title"], json!("a"));
        assert_eq!(provider.backend().statements_like("LIMIT 1").len(), 1);

        let count = provider
            .count("Article", QueryRequest::new().criterion("id", json!({"id": 1})).sort("title"))
            .await
            .unwrap();
        assert_eq!(count, 2);
        let (sql, params) = provider.backend().statements_like("COUNT(*)").remove(0);
        assert!(!sql.contains("ORDER BY"));
        assert_eq!(params, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_single_absent() {
        let provider = provider(MockBackend::new(Dialect::Sqlite));
        let record = provider
            .single("Article", QueryRequest::new().criterion("id", json!({"id": 99})))
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_nested_lists_and_middleware() {
        let backend = MockBackend::new(Dialect::Sqlite)
            .respond("\"comments\"", vec![json!({"text": "first", "$id": 10})])
            .respond(
                "SELECT",
                vec![json!({"title": "a", "$id": 1}), json!({"title": "b", "$id": 2})],
            );
        let provider = provider(backend);

        let list = provider
            .list("Article", QueryRequest::new().projection("withComments"))
            .await
            .unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["comments"], json!([{"text": "first", "$id": 10}]));
        assert_eq!(list[1]["commentCount"], json!(1));

        let nested = provider.backend().statements_like("\"comments\"");
        assert_eq!(nested.len(), 2);
        let mut parents: Vec<Value> = nested
            .into_iter()
            .map(|(_, params)| params[0].clone())
            .collect();
        parents.sort_by_key(|id| id.as_i64());
        assert_eq!(parents, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_denormalized_tags() {
        let backend = MockBackend::new(Dialect::Sqlite)
            .respond(
                "FROM \"tags\"",
                vec![json!({"name": "one", "$id": 1}), json!({"name": "another", "$id": 2})],
            )
            .respond("SELECT", vec![json!({"title": "a", "tags": "2,1,9", "$id": 1})]);
        let provider = provider(backend);

        let list = provider
            .list("Article", QueryRequest::new().projection("withTags"))
            .await
            .unwrap();

        assert_eq!(
            list[0]["tags"],
            json!([{"name": "another", "$id": 2}, {"name": "one", "$id": 1}, null])
        );
    }

    #[tokio::test]
    async fn test_cached_list_identity() {
        let backend = MockBackend::new(Dialect::Sqlite)
            .respond("SELECT", vec![json!({"name": "one", "$id": 1})]);
        let provider = provider(backend);

        let first = provider.list("Tag", QueryRequest::new()).await.unwrap();
        let second = provider.list("Tag", QueryRequest::new()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.backend().statements().len(), 1);

        let uncached = provider.list("Tag", QueryRequest::new().cached(false)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &uncached));

        provider.invalidate("Tag").await.unwrap();
        let refilled = provider.list("Tag", QueryRequest::new()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &refilled));
        assert_eq!(provider.backend().statements().len(), 3);
    }

    #[tokio::test]
    async fn test_cache_disabled_by_config() {
        let backend = MockBackend::new(Dialect::Sqlite)
            .respond("SELECT", vec![json!({"name": "one", "$id": 1})]);
        let provider = Provider::builder(blog_schema(), backend)
            .config(ProviderConfig {
                use_cache: false,
                ..ProviderConfig::default()
            })
            .model(
                Model::new("Tag")
                    .cached(Duration::from_secs(60))
                    .projection("default", Projection::new().column("name", "name")),
            )
            .build()
            .unwrap();

        let first = provider.list("Tag", QueryRequest::new()).await.unwrap();
        let second = provider.list("Tag", QueryRequest::new()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_nested_projection_errors_before_any_statement() {
        let model = Model::new("Article").projection(
            "default",
            Projection::new().list(
                "comments",
                NestedList::new(
                    "comments",
                    Projection::new()
                        .field("missing", FieldLeaf::new("m").function(Function::Count)),
                ),
            ),
        );
        let provider = Provider::builder(blog_schema(), MockBackend::new(Dialect::Sqlite))
            .model(model.clone())
            .build()
            .unwrap();

        let err = provider.list("Article", QueryRequest::new()).await;
        assert!(matches!(err, Err(QueryError::UnknownAttribute { .. })));
        assert!(provider.compile("Article", &QueryRequest::new()).is_err());
        assert!(provider.backend().statements().is_empty());

        let backend = MockBackend::new(Dialect::Sqlite).respond("SELECT", vec![json!({"$id": 1})]);
        let provider = Provider::builder(blog_schema(), backend).model(model).build().unwrap();

        let err = provider.single("Article", QueryRequest::new()).await;
        assert!(matches!(err, Err(QueryError::UnknownAttribute { .. })));
        assert!(provider.backend().statements().is_empty());
    }

    #[tokio::test]
    async fn test_request_related_unsupported() {
        let provider = provider(MockBackend::new(Dialect::Sqlite));
        let err = provider.request_related("Article", QueryRequest::new()).await;
        assert!(matches!(err, Err(QueryError::Unsupported(_))));
    }
}
