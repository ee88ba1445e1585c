//! Model definitions and query requests.
//!
//! A model binds named projections, criteria and sorts to one entity. Requests
//! refer to them by name.

use crate::compiler::CriteriaPool;
use crate::criteria::CriteriaSpec;
use crate::error::{QueryError, Result};
use crate::projection::{Leaf, Projection, Sort};
use crate::query::Page;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Projection used when a request names none
pub const DEFAULT_PROJECTION: &str = "default";

/// Empty projection registered on every model, used by counts
pub const COUNT_PROJECTION: &str = "$count";

/// Random order sort registered on every model
pub const RANDOM_SORT: &str = "$random";

#[derive(Debug, Clone)]
pub struct Model {
    entity: String,
    cache_timeout: Option<Duration>,
    projections: HashMap<String, Arc<Projection>>,
    criteria: HashMap<String, CriteriaSpec>,
    sorts: HashMap<String, Sort>,
}

impl Model {
    pub fn new(entity: &str) -> Self {
        let mut projections = HashMap::new();
        projections.insert(COUNT_PROJECTION.to_string(), Arc::new(Projection::new()));

        let mut sorts = HashMap::new();
        sorts.insert(RANDOM_SORT.to_string(), Sort::Random);

        Self {
            entity: entity.to_string(),
            cache_timeout: None,
            projections,
            criteria: HashMap::new(),
            sorts,
        }
    }

    /// Memoize the model's unfiltered lists for `timeout`
    pub fn cached(mut self, timeout: Duration) -> Self {
        self.cache_timeout = Some(timeout);
        self
    }

    pub fn projection(mut self, name: &str, projection: Projection) -> Self {
        self.projections.insert(name.to_string(), Arc::new(projection));
        self
    }

    pub fn criteria(mut self, name: &str, spec: CriteriaSpec) -> Self {
        self.criteria.insert(name.to_string(), spec);
        self
    }

    pub fn sort(mut self, name: &str, sort: Sort) -> Self {
        self.sorts.insert(name.to_string(), sort);
        self
    }

    /// Register `name` (ascending) and `-name` (descending) for each `(path, name)`
    pub fn sort_multiple<'p>(
        mut self,
        entries: impl IntoIterator<Item = (&'p str, &'p str)>,
    ) -> Self {
        for (path, name) in entries {
            self.sorts.insert(name.to_string(), Sort::asc(path));
            self.sorts.insert(format!("-{}", name), Sort::desc(path));
        }
        self
    }

    /// Register ascending and descending sorts for every plain column of a projection
    pub fn sort_projection(self, name: &str) -> Result<Self> {
        let projection = self.get_projection(name)?.clone();
        let entries: Vec<(String, String)> = projection
            .fields()
            .iter()
            .filter_map(|(path, leaf)| match leaf {
                Leaf::Column(alias) => Some((path.clone(), alias.clone())),
                _ => None,
            })
            .collect();

        Ok(self.sort_multiple(entries.iter().map(|(p, a)| (p.as_str(), a.as_str()))))
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn cache_timeout(&self) -> Option<Duration> {
        self.cache_timeout
    }

    pub fn get_projection(&self, name: &str) -> Result<&Arc<Projection>> {
        self.projections
            .get(name)
            .ok_or_else(|| QueryError::UnknownProjection(name.to_string()))
    }

    pub fn get_sort(&self, name: &str) -> Result<&Sort> {
        self.sorts
            .get(name)
            .ok_or_else(|| QueryError::UnknownSort(name.to_string()))
    }

    pub fn get_criteria(&self, name: &str) -> Result<&CriteriaSpec> {
        self.criteria
            .get(name)
            .ok_or_else(|| QueryError::UnknownCriterion(name.to_string()))
    }
}

/// One sort name or several, applied in order
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SortRequest {
    One(String),
    Many(Vec<String>),
}

impl SortRequest {
    pub fn names(&self) -> Vec<&str> {
        match self {
            SortRequest::One(name) => vec![name.as_str()],
            SortRequest::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Page parameter as sent by callers: a number or a numeric string
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PageParam {
    Number(i64),
    Text(String),
}

impl PageParam {
    pub fn parse(&self, name: &str) -> Result<i64> {
        match self {
            PageParam::Number(n) => Ok(*n),
            PageParam::Text(s) => s.trim().parse().map_err(|_| {
                QueryError::InvalidPageParameters(format!(
                    "{} must be a valid number, got `{}`",
                    name, s
                ))
            }),
        }
    }
}

impl From<i64> for PageParam {
    fn from(n: i64) -> Self {
        PageParam::Number(n)
    }
}

impl From<i32> for PageParam {
    fn from(n: i32) -> Self {
        PageParam::Number(n.into())
    }
}

impl From<&str> for PageParam {
    fn from(s: &str) -> Self {
        PageParam::Text(s.to_string())
    }
}

/// A caller's query: named projection, criteria value bags, sorts and paging
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub projection: Option<String>,
    #[serde(default)]
    pub criteria: CriteriaPool,
    pub sort: Option<SortRequest>,
    pub page: Option<PageParam>,
    pub page_size: Option<PageParam>,
    pub cached: Option<bool>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(mut self, name: &str) -> Self {
        self.projection = Some(name.to_string());
        self
    }

    /// Add the value bag of a named criteria
    pub fn criterion(mut self, name: &str, values: Value) -> Self {
        self.criteria.insert(name.to_string(), values);
        self
    }

    pub fn sort(mut self, name: &str) -> Self {
        self.sort = Some(match self.sort.take() {
            None => SortRequest::One(name.to_string()),
            Some(SortRequest::One(first)) => SortRequest::Many(vec![first, name.to_string()]),
            Some(SortRequest::Many(mut names)) => {
                names.push(name.to_string());
                SortRequest::Many(names)
            }
        });
        self
    }

    pub fn page(mut self, page: impl Into<PageParam>, size: impl Into<PageParam>) -> Self {
        self.page = Some(page.into());
        self.page_size = Some(size.into());
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = Some(cached);
        self
    }

    pub fn sort_names(&self) -> Vec<&str> {
        self.sort.as_ref().map(SortRequest::names).unwrap_or_default()
    }

    /// Whether any criteria carries a value
    pub fn has_criteria(&self) -> bool {
        self.criteria.values().any(|values| !values.is_null())
    }

    /// Validated paging; the page number defaults to 1 but a page needs a size
    pub fn page_params(&self) -> Result<Option<Page>> {
        match (&self.page, &self.page_size) {
            (page, Some(size)) => {
                let number = match page {
                    Some(page) => page.parse("page")?,
                    None => 1,
                };
                Ok(Some(Page::new(number, size.parse("pageSize")?)?))
            }
            (Some(_), None) => Err(QueryError::InvalidPageParameters(
                "pageSize is required when page is given".to_string(),
            )),
            (None, None) => Ok(None),
        }
    }

    /// Key of the cached list this request would produce
    pub fn cache_key(&self, default_projection: &str) -> Result<String> {
        let projection = self.projection.as_deref().unwrap_or(default_projection);
        let page = self
            .page_params()?
            .map(|page| format!("{}:{}", page.number, page.size))
            .unwrap_or_default();
        Ok(format!("{}|{}|{}", projection, self.sort_names().join(","), page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Operator;
    use crate::projection::{FieldLeaf, Function};
    use serde_json::json;

    fn article() -> Model {
        Model::new("Article")
            .projection(
                "default",
                Projection::new()
                    .column("title", "title")
                    .column("author.name", "authorName")
                    .field("comments.$id", FieldLeaf::new("comments").function(Function::Count)),
            )
            .criteria("id", CriteriaSpec::single("id", "id", Operator::Equal))
    }

    #[test]
    fn test_builtin_entries() {
        let model = Model::new("Article");
        assert!(model.get_projection(COUNT_PROJECTION).unwrap().fields().is_empty());
        assert_eq!(model.get_sort(RANDOM_SORT).unwrap(), &Sort::Random);
        assert!(model.cache_timeout().is_none());
    }

    #[test]
    fn test_lookup_errors() {
        let model = article();
        assert!(matches!(
            model.get_projection("short"),
            Err(QueryError::UnknownProjection(n)) if n == "short"
        ));
        assert!(matches!(model.get_sort("title"), Err(QueryError::UnknownSort(_))));
        assert!(matches!(model.get_criteria("name"), Err(QueryError::UnknownCriterion(_))));
        assert!(model.get_criteria("id").is_ok());
    }

    #[test]
    fn test_sort_projection() {
        let model = article().sort_projection("default").unwrap();

        assert_eq!(model.get_sort("title").unwrap(), &Sort::asc("title"));
        assert_eq!(model.get_sort("-authorName").unwrap(), &Sort::desc("author.name"));
        assert!(model.get_sort("comments").is_err());
        assert!(article().sort_projection("missing").is_err());
    }

    #[test]
    fn test_request_deserialization() {
        let request: QueryRequest = serde_json::from_value(json!({
            "projection": "default",
            "criteria": {"id": {"id": 3}, "empty": null},
            "sort": ["title", "-views"],
            "page": "2",
            "pageSize": 10
        }))
        .unwrap();

        assert_eq!(request.projection.as_deref(), Some("default"));
        assert_eq!(request.sort_names(), vec!["title", "-views"]);
        assert_eq!(request.page.as_ref().unwrap().parse("page").unwrap(), 2);
        assert_eq!(request.page_size, Some(PageParam::Number(10)));
        assert!(request.has_criteria());

        let request: QueryRequest = serde_json::from_value(json!({"sort": "title"})).unwrap();
        assert_eq!(request.sort_names(), vec!["title"]);
        assert!(!request.has_criteria());
    }

    #[test]
    fn test_request_builder() {
        let request = QueryRequest::new()
            .projection("short")
            .criterion("id", json!({"id": 1}))
            .sort("title")
            .sort("-views")
            .page(1, "5")
            .cached(false);

        assert_eq!(request.sort_names(), vec!["title", "-views"]);
        assert_eq!(request.page_size.unwrap().parse("pageSize").unwrap(), 5);
        assert_eq!(request.cached, Some(false));
        assert!(PageParam::from("x").parse("page").is_err());
    }

    #[test]
    fn test_page_params() {
        assert_eq!(QueryRequest::new().page_params().unwrap(), None);

        let request = QueryRequest {
            page_size: Some(PageParam::from("5")),
            ..QueryRequest::default()
        };
        assert_eq!(request.page_params().unwrap(), Some(Page::new(1, 5).unwrap()));

        let request = QueryRequest {
            page: Some(PageParam::from(2)),
            ..QueryRequest::default()
        };
        assert!(matches!(request.page_params(), Err(QueryError::InvalidPageParameters(_))));
        assert!(QueryRequest::new().page("two", 5).page_params().is_err());
        assert!(QueryRequest::new().page(0, 5).page_params().is_err());
        assert!(QueryRequest::new().page(1, -5).page_params().is_err());
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(QueryRequest::new().cache_key("default").unwrap(), "default||");
        assert_eq!(
            QueryRequest::new()
                .projection("short")
                .sort("title")
                .sort("-views")
                .page(2, 10)
                .cache_key("default")
                .unwrap(),
            "short|title,-views|2:10"
        );
    }
}
