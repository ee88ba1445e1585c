//! Row-fetch and count statements kept in lockstep, plus pagination.

use crate::builder::{Condition, Fragment, JoinType, SelectBuilder, SortDirection, Statement};
use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use crate::materialize::Record;
use serde::Serialize;

/// Alias of the column returned by the count statement
pub const COUNT_COLUMN: &str = "count";

/// A page request: 1-based page number and page size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u64,
    pub size: u64,
}

impl Page {
    pub fn new(number: i64, size: i64) -> Result<Self> {
        if size <= 0 {
            return Err(QueryError::InvalidPageParameters(format!(
                "page size must be a positive integer, got {}",
                size
            )));
        }
        if number <= 0 {
            return Err(QueryError::InvalidPageParameters(format!(
                "page must be a positive integer, got {}",
                number
            )));
        }
        if (number - 1).checked_mul(size).is_none() {
            return Err(QueryError::InvalidPageParameters(format!(
                "page {} of size {} is out of range",
                number, size
            )));
        }
        Ok(Self {
            number: number as u64,
            size: size as u64,
        })
    }

    pub fn offset(&self) -> u64 {
        (self.number - 1) * self.size
    }

    /// Number of pages needed for `count` rows
    pub fn pages(&self, count: u64) -> u64 {
        count.div_ceil(self.size)
    }
}

/// One page of results with the total count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResult {
    pub list: Vec<Record>,
    pub count: u64,
    pub page: u64,
    pub pages: u64,
}

/// Two statements sharing FROM, JOIN, WHERE, GROUP BY and HAVING.
///
/// The select statement additionally owns the field list, ordering and paging;
/// the count statement selects a constant.
#[derive(Debug, Clone)]
pub struct QueryPair {
    select: SelectBuilder,
    count: SelectBuilder,
    page: Option<Page>,
}

impl QueryPair {
    pub fn new(table: &str, alias: &str) -> Self {
        let mut count = SelectBuilder::new(table, alias);
        count.field("0", None);

        Self {
            select: SelectBuilder::new(table, alias),
            count,
            page: None,
        }
    }

    pub fn field(&mut self, expression: impl Into<String>, alias: &str) -> &mut Self {
        self.select.field(expression, Some(alias));
        self
    }

    pub fn join(
        &mut self,
        join_type: JoinType,
        table: &str,
        alias: &str,
        on: Condition,
    ) -> &mut Self {
        self.select.join(join_type, table, alias, on.clone());
        self.count.join(join_type, table, alias, on);
        self
    }

    pub fn and_where(&mut self, condition: Condition) -> &mut Self {
        self.select.and_where(condition.clone());
        self.count.and_where(condition);
        self
    }

    pub fn having(&mut self, condition: Condition) -> &mut Self {
        self.select.having(condition.clone());
        self.count.having(condition);
        self
    }

    pub fn group_by(&mut self, expression: &str) -> &mut Self {
        self.select.group_by(expression);
        self.count.group_by(expression);
        self
    }

    pub fn order_by(
        &mut self,
        expression: impl Into<String>,
        direction: Option<SortDirection>,
    ) -> &mut Self {
        self.select.order_by(expression, direction);
        self
    }

    /// Restrict the select statement to one page
    pub fn page(&mut self, page: Page) -> &mut Self {
        self.select.offset(page.offset()).limit(page.size);
        self.page = Some(page);
        self
    }

    pub fn current_page(&self) -> Option<Page> {
        self.page
    }

    pub fn select(&self) -> &SelectBuilder {
        &self.select
    }

    pub fn count(&self) -> &SelectBuilder {
        &self.count
    }

    pub fn select_statement(&self, dialect: Dialect) -> Result<Statement> {
        self.select.build(dialect)
    }

    /// The select statement limited to one row
    pub fn single_statement(&self, dialect: Dialect) -> Result<Statement> {
        let mut select = self.select.clone();
        select.limit(1);
        select.build(dialect)
    }

    /// `SELECT COUNT(*)` over the count statement, so grouped queries count groups
    pub fn count_statement(&self, dialect: Dialect) -> Result<Statement> {
        let inner = self.count.to_fragment(dialect)?;
        let fragment = Fragment {
            sql: format!(
                "SELECT COUNT(*) AS {} FROM ({}) AS c",
                dialect.quote(COUNT_COLUMN),
                inner.sql
            ),
            values: inner.values,
        };
        Ok(Statement::new(fragment, dialect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_arithmetic() {
        let page = Page::new(3, 5).unwrap();
        assert_eq!(page.offset(), 10);
        assert_eq!(page.pages(11), 3);
        assert_eq!(page.pages(10), 2);
        assert_eq!(page.pages(0), 0);
    }

    #[test]
    fn test_page_validation() {
        assert!(matches!(Page::new(1, 0), Err(QueryError::InvalidPageParameters(_))));
        assert!(matches!(Page::new(0, 10), Err(QueryError::InvalidPageParameters(_))));
        assert!(matches!(Page::new(-1, 10), Err(QueryError::InvalidPageParameters(_))));
        assert!(matches!(
            Page::new(i64::MAX, i64::MAX),
            Err(QueryError::InvalidPageParameters(_))
        ));
        assert!(matches!(Page::new(4, i64::MAX / 2), Err(QueryError::InvalidPageParameters(_))));
        assert_eq!(Page::new(1, i64::MAX).unwrap().offset(), 0);
    }

    #[test]
    fn test_pair_stays_in_sync() {
        let mut pair = QueryPair::new("articles", "article_1");
        pair.field("article_1.id", "$id")
            .join(
                JoinType::Left,
                "authors",
                "author_2",
                Condition::columns_eq("article_1.authorId", "author_2.id"),
            )
            .and_where(Condition::eq("author_2.name", json!("Ann")))
            .group_by("article_1.id")
            .order_by("article_1.id", Some(SortDirection::Desc))
            .page(Page::new(2, 10).unwrap());

        let select = pair.select_statement(Dialect::Sqlite).unwrap();
        assert_eq!(
            select.sql,
            "SELECT article_1.id AS \"$id\" FROM \"articles\" AS article_1 LEFT JOIN \"authors\" AS author_2 ON article_1.authorId = author_2.id WHERE author_2.name = ? GROUP BY article_1.id ORDER BY article_1.id DESC LIMIT 10 OFFSET 10"
        );

        let count = pair.count_statement(Dialect::Sqlite).unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) AS \"count\" FROM (SELECT 0 FROM \"articles\" AS article_1 LEFT JOIN \"authors\" AS author_2 ON article_1.authorId = author_2.id WHERE author_2.name = ? GROUP BY article_1.id) AS c"
        );
        assert_eq!(count.params, vec![json!("Ann")]);
        assert_eq!(pair.current_page(), Some(Page { number: 2, size: 10 }));
    }

    #[test]
    fn test_single_statement_limits() {
        let mut pair = QueryPair::new("articles", "article_1");
        pair.field("article_1.id", "$id").and_where(Condition::eq("article_1.id", json!(7)));

        let single = pair.single_statement(Dialect::Postgres).unwrap();
        assert!(single.sql.ends_with("WHERE article_1.id = $1 LIMIT 1"));
        assert!(!pair.select_statement(Dialect::Postgres).unwrap().sql.contains("LIMIT"));
    }
}
