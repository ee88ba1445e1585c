//! SQL dialect overrides.
//!
//! Everything that differs between the supported databases lives here:
//! identifier quoting, bind placeholders and the spelling of the handful of
//! aggregate functions the compiler emits. The function table is a plain
//! strategy record selected by dialect name, resolved once per provider.

use std::borrow::Cow;
use std::fmt;

/// Supported SQL dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    MySql,
    Postgres,
    /// SQLite, also used for any dialect name without a dedicated table
    #[default]
    Sqlite,
}

impl Dialect {
    /// Resolve a dialect by name (`mysql`, `postgres`, anything else is the default)
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Dialect::MySql,
            "postgres" | "postgresql" | "pg" => Dialect::Postgres,
            _ => Dialect::Sqlite,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Quote an identifier (table name or output alias)
    pub fn quote(&self, identifier: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", identifier.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
        }
    }

    /// Render the bind placeholder for the given 1-based parameter index
    pub fn placeholder(&self, index: usize) -> Cow<'static, str> {
        match self {
            Dialect::Postgres => Cow::Owned(format!("${}", index)),
            Dialect::MySql | Dialect::Sqlite => Cow::Borrowed("?"),
        }
    }

    /// The aggregate function table for this dialect
    pub fn functions(&self) -> &'static Functions {
        Functions::for_dialect(self.name())
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Per-dialect spelling of the functions used by projections and criteria
#[derive(Debug)]
pub struct Functions {
    pub dialect: &'static str,
    convert: fn(&str, Option<&str>) -> String,
    group_concat: fn(&str) -> String,
    sum: fn(&str) -> String,
    count: fn(&str) -> String,
    random: fn() -> String,
}

impl Functions {
    /// Look up the function table by dialect name
    pub fn for_dialect(name: &str) -> &'static Functions {
        match Dialect::from_name(name) {
            Dialect::MySql => &MYSQL,
            Dialect::Postgres => &POSTGRES,
            Dialect::Sqlite => &DEFAULT,
        }
    }

    /// Character set conversion; not an aggregate
    pub fn convert(&self, column: &str, charset: Option<&str>) -> String {
        (self.convert)(column, charset)
    }

    /// Comma separated concatenation of a group
    pub fn group_concat(&self, column: &str) -> String {
        (self.group_concat)(column)
    }

    pub fn sum(&self, expression: &str) -> String {
        (self.sum)(expression)
    }

    pub fn count(&self, column: &str) -> String {
        (self.count)(column)
    }

    /// Random ordering expression
    pub fn random(&self) -> String {
        (self.random)()
    }
}

static MYSQL: Functions = Functions {
    dialect: "mysql",
    convert: |column, charset| format!("CONVERT({} USING {})", column, charset.unwrap_or("utf8")),
    group_concat: |column| format!("GROUP_CONCAT({})", column),
    sum: |expression| format!("SUM({})", expression),
    count: |column| format!("COUNT({})", column),
    random: || "RAND()".to_string(),
};

static POSTGRES: Functions = Functions {
    dialect: "postgres",
    convert: |column, _| column.to_string(),
    group_concat: |column| format!("STRING_AGG(CAST({} AS TEXT), ',')", column),
    sum: |expression| format!("SUM({})", expression),
    count: |column| format!("COUNT({})", column),
    random: || "RANDOM()".to_string(),
};

static DEFAULT: Functions = Functions {
    dialect: "sqlite",
    convert: |column, _| column.to_string(),
    group_concat: |column| format!("GROUP_CONCAT({})", column),
    sum: |expression| format!("SUM({})", expression),
    count: |column| format!("COUNT({})", column),
    random: || "RANDOM()".to_string(),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(Dialect::from_name("mysql"), Dialect::MySql);
        assert_eq!(Dialect::from_name("Postgres"), Dialect::Postgres);
        assert_eq!(Dialect::from_name("sqlite"), Dialect::Sqlite);
        assert_eq!(Dialect::from_name("mssql"), Dialect::Sqlite);
    }

    #[test]
    fn test_quote() {
        assert_eq!(Dialect::MySql.quote("author.name"), "`author.name`");
        assert_eq!(Dialect::Postgres.quote("$id"), "\"$id\"");
        assert_eq!(Dialect::Sqlite.quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_placeholder() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::MySql.placeholder(3), "?");
    }

    #[test]
    fn test_functions_per_dialect() {
        let mysql = Dialect::MySql.functions();
        assert_eq!(mysql.group_concat("t.id"), "GROUP_CONCAT(t.id)");
        assert_eq!(mysql.convert("t.body", None), "CONVERT(t.body USING utf8)");
        assert_eq!(mysql.random(), "RAND()");

        let postgres = Functions::for_dialect("postgres");
        assert_eq!(postgres.group_concat("t.id"), "STRING_AGG(CAST(t.id AS TEXT), ',')");
        assert_eq!(postgres.convert("t.body", Some("latin1")), "t.body");

        let fallback = Functions::for_dialect("unknown");
        assert_eq!(fallback.dialect, "sqlite");
        assert_eq!(fallback.sum("x"), "SUM(x)");
        assert_eq!(fallback.count("x"), "COUNT(x)");
    }
}
