//! projection-query - declarative relational query compiler
//!
//! Models declare named projections, criteria and sorts over a relational
//! schema. A request names the ones it wants; the provider compiles them into a
//! pair of SQL statements (rows and count), executes them and materializes the
//! flat rows into nested records.
//!
//! # Architecture
//!
//! - **Path resolution**: dotted association paths become joins, each joined
//!   path is planned once and reused
//! - **Projection compiling**: plain columns, aggregates, denormalized to-many
//!   columns and deferred nested lists
//! - **Criteria**: an operator table injecting predicates into WHERE, HAVING or
//!   a join's ON clause
//! - **Query pair**: row and count statements that never diverge in filtering
//! - **Materialization**: coercion, dotted alias unflattening, nested lists and
//!   middlewares
//! - **Caching**: time-boxed lists of cache-enabled models, also used to
//!   resolve to-many columns without joining
//!
//! # Example
//!
//! ```rust,no_run
//! use projection_query::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let schema = Schema::new()
//!         .with(
//!             EntityMetadata::new("Author", "authors")
//!                 .primary_key("id", SqlType::Integer)
//!                 .attribute("name", SqlType::Text),
//!         )?
//!         .with(
//!             EntityMetadata::new("Article", "articles")
//!                 .primary_key("id", SqlType::Integer)
//!                 .attribute("title", SqlType::Text)
//!                 .belongs_to("author", "Author", "authorId"),
//!         )?;
//!
//!     let articles = Model::new("Article")
//!         .projection(
//!             "default",
//!             Projection::new()
//!                 .column("title", "title")
//!                 .column("author.name", "author.name"),
//!         )
//!         .criteria("title", CriteriaSpec::single("title", "title", Operator::Like))
//!         .sort_projection("default")?;
//!
//!     #[cfg(feature = "sqlite")]
//!     {
//!         let backend = SqliteBackend::memory().await?;
//!         backend.execute_batch(&schema.generate_ddl(backend.dialect())?).await?;
//!
//!         let provider = Provider::builder(schema, backend).model(articles).build()?;
//!         let page = provider
//!             .request_list(
//!                 "Article",
//!                 QueryRequest::new()
//!                     .criterion("title", json!({"title": "rust"}))
//!                     .sort("-title")
//!                     .page(1, 20),
//!             )
//!             .await?;
//!         println!("{} of {} articles", page.list.len(), page.count);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Enable backends via Cargo features:
//!
//! ```toml
//! [dependencies]
//! projection-query = { version = "0.1", features = ["postgres", "mysql"] }
//! ```

pub mod backend;
pub mod builder;
pub mod cache;
pub mod compiler;
pub mod criteria;
pub mod dialect;
pub mod error;
pub mod materialize;
pub mod model;
pub mod operators;
pub mod plan;
pub mod projection;
pub mod provider;
pub mod query;
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub mod mysql;

pub use backend::{DatabaseBackend, QueryResult, QueryRow};
pub use builder::{
    ComparisonOp, Condition, JoinType, LogicalOp, SelectBuilder, SortDirection, Statement,
};
pub use cache::ModelCache;
pub use compiler::{Compilation, CompiledQuery, CriteriaPool, ModelCatalog};
pub use criteria::{CriteriaSpec, Criterion, StaticValue};
pub use dialect::{Dialect, Functions};
pub use error::{QueryError, Result};
pub use materialize::{EntityIndex, FieldHandler, Middleware, Record};
pub use model::{Model, PageParam, QueryRequest, SortRequest};
pub use operators::Operator;
pub use plan::{JoinMode, JoinPlan, ResolvedPath};
pub use projection::{
    FieldLeaf, Function, Leaf, NestedList, Projection, ScopedCriterion, Sort, SortField,
};
pub use provider::{Provider, ProviderBuilder, ProviderConfig};
pub use query::{ListResult, Page, QueryPair};
pub use schema::{
    AssociationKind, AssociationMeta, AttributeDef, EntityMetadata, LinkTable, Schema, SqlType,
};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

#[cfg(feature = "mysql")]
pub use mysql::MySqlBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
    pub use crate::builder::SortDirection;
    pub use crate::criteria::{CriteriaSpec, Criterion};
    pub use crate::dialect::Dialect;
    pub use crate::error::{QueryError, Result};
    pub use crate::materialize::Record;
    pub use crate::model::{Model, QueryRequest};
    pub use crate::operators::Operator;
    pub use crate::projection::{FieldLeaf, Function, NestedList, Projection, ScopedCriterion, Sort};
    pub use crate::provider::{Provider, ProviderConfig};
    pub use crate::query::ListResult;
    pub use crate::schema::{EntityMetadata, LinkTable, Schema, SqlType};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;

    #[cfg(feature = "mysql")]
    pub use crate::mysql::MySqlBackend;
}
