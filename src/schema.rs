use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use std::collections::HashMap;

/// Soft-delete column used by `EntityMetadata::paranoid`
pub const DEFAULT_DELETED_COLUMN: &str = "deletedAt";

/// SQL type mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Integer,
    SmallInt,
    Real,
    DoublePrecision,
    Text,
    Boolean,
    Timestamp,
    Json,
    Bytea,
}

impl SqlType {
    pub fn to_sql(&self, dialect: Dialect) -> &'static str {
        match (self, dialect) {
            (SqlType::BigInt, _) => "BIGINT",
            (SqlType::Integer, _) => "INTEGER",
            (SqlType::SmallInt, _) => "SMALLINT",
            (SqlType::Real, _) => "REAL",
            (SqlType::DoublePrecision, Dialect::MySql) => "DOUBLE",
            (SqlType::DoublePrecision, _) => "DOUBLE PRECISION",
            (SqlType::Text, _) => "TEXT",
            (SqlType::Boolean, _) => "BOOLEAN",
            (SqlType::Timestamp, Dialect::MySql) => "DATETIME",
            (SqlType::Timestamp, _) => "TIMESTAMP",
            (SqlType::Json, Dialect::Postgres) => "JSONB",
            (SqlType::Json, Dialect::MySql) => "JSON",
            (SqlType::Json, Dialect::Sqlite) => "TEXT",
            (SqlType::Bytea, Dialect::Postgres) => "BYTEA",
            (SqlType::Bytea, _) => "BLOB",
        }
    }
}

/// Attribute definition: logical name, physical column and type
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    pub column: String,
    pub sql_type: SqlType,
}

/// Link table backing a many-to-many association
#[derive(Debug, Clone, PartialEq)]
pub struct LinkTable {
    pub table: String,
    /// Column pointing at the source entity
    pub source_column: String,
    /// Column pointing at the target entity
    pub target_column: String,
}

impl LinkTable {
    pub fn new(
        table: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            source_column: source_column.into(),
            target_column: target_column.into(),
        }
    }
}

/// Association kinds
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationKind {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany(LinkTable),
}

impl AssociationKind {
    /// Whether a path through this association yields many rows per parent
    pub fn is_to_many(&self) -> bool {
        matches!(self, AssociationKind::HasMany | AssociationKind::BelongsToMany(_))
    }
}

/// Association metadata.
///
/// `foreign_key` is a column name: on the source table for `BelongsTo`, on the
/// target table for `HasOne` and `HasMany`. It is unused for `BelongsToMany`,
/// which goes through its link table. `source_key` and `target_key` are attribute
/// names and default to the primary keys.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationMeta {
    pub alias: String,
    pub kind: AssociationKind,
    pub target: String,
    pub foreign_key: String,
    pub source_key: Option<String>,
    pub target_key: Option<String>,
}

impl AssociationMeta {
    pub fn new(
        alias: impl Into<String>,
        kind: AssociationKind,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            kind,
            target: target.into(),
            foreign_key: foreign_key.into(),
            source_key: None,
            target_key: None,
        }
    }

    pub fn source_key(mut self, attribute: impl Into<String>) -> Self {
        self.source_key = Some(attribute.into());
        self
    }

    pub fn target_key(mut self, attribute: impl Into<String>) -> Self {
        self.target_key = Some(attribute.into());
        self
    }
}

/// Read-only description of one entity and its table
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    primary_key: Option<String>,
    attributes: Vec<AttributeDef>,
    soft_delete: Option<String>,
    associations: Vec<AssociationMeta>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: None,
            attributes: Vec::new(),
            soft_delete: None,
            associations: Vec::new(),
        }
    }

    /// Declare the primary key attribute (column named after it)
    pub fn primary_key(self, name: &str, sql_type: SqlType) -> Self {
        self.primary_key_column(name, name, sql_type)
    }

    pub fn primary_key_column(mut self, name: &str, column: &str, sql_type: SqlType) -> Self {
        self.primary_key = Some(name.to_string());
        self.attribute_column(name, column, sql_type)
    }

    /// Declare an attribute stored in a column of the same name
    pub fn attribute(self, name: &str, sql_type: SqlType) -> Self {
        self.attribute_column(name, name, sql_type)
    }

    pub fn attribute_column(mut self, name: &str, column: &str, sql_type: SqlType) -> Self {
        self.attributes.retain(|a| a.name != name);
        self.attributes.push(AttributeDef {
            name: name.to_string(),
            column: column.to_string(),
            sql_type,
        });
        self
    }

    /// Enable soft deletes on the default `deletedAt` column
    pub fn paranoid(self) -> Self {
        self.soft_delete(DEFAULT_DELETED_COLUMN)
    }

    pub fn soft_delete(mut self, column: &str) -> Self {
        self.soft_delete = Some(column.to_string());
        self
    }

    pub fn belongs_to(self, alias: &str, target: &str, foreign_key: &str) -> Self {
        self.association(AssociationMeta::new(
            alias,
            AssociationKind::BelongsTo,
            target,
            foreign_key,
        ))
    }

    pub fn has_one(self, alias: &str, target: &str, foreign_key: &str) -> Self {
        self.association(AssociationMeta::new(alias, AssociationKind::HasOne, target, foreign_key))
    }

    pub fn has_many(self, alias: &str, target: &str, foreign_key: &str) -> Self {
        self.association(AssociationMeta::new(alias, AssociationKind::HasMany, target, foreign_key))
    }

    pub fn belongs_to_many(self, alias: &str, target: &str, link: LinkTable) -> Self {
        self.association(AssociationMeta::new(
            alias,
            AssociationKind::BelongsToMany(link),
            target,
            "",
        ))
    }

    pub fn association(mut self, association: AssociationMeta) -> Self {
        self.associations.retain(|a| a.alias != association.alias);
        self.associations.push(association);
        self
    }

    /// The primary key attribute
    pub fn pk(&self) -> Result<&AttributeDef> {
        self.primary_key
            .as_deref()
            .and_then(|name| self.find_attribute(name))
            .ok_or_else(|| QueryError::Schema(format!("Entity {} has no primary key", self.name)))
    }

    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_association(&self, alias: &str) -> Option<&AssociationMeta> {
        self.associations.iter().find(|a| a.alias == alias)
    }

    /// Resolve an attribute by name, failing with `UnknownAttribute`
    pub fn attribute_def(&self, name: &str) -> Result<&AttributeDef> {
        self.find_attribute(name).ok_or_else(|| QueryError::UnknownAttribute {
            attribute: name.to_string(),
            entity: self.name.clone(),
        })
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn associations(&self) -> &[AssociationMeta] {
        &self.associations
    }

    pub fn soft_delete_column(&self) -> Option<&str> {
        self.soft_delete.as_deref()
    }

    /// Column name of the given key attribute, or the primary key column
    pub fn key_column(&self, key: Option<&str>) -> Result<&str> {
        match key {
            Some(name) => Ok(&self.attribute_def(name)?.column),
            None => Ok(&self.pk()?.column),
        }
    }
}

/// Registry of entity metadata
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: HashMap<String, EntityMetadata>,
    order: Vec<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity
    pub fn register(&mut self, entity: EntityMetadata) -> Result<()> {
        if self.entities.contains_key(&entity.name) {
            return Err(QueryError::Schema(format!(
                "Entity {} already registered",
                entity.name
            )));
        }

        entity.pk()?;

        self.order.push(entity.name.clone());
        self.entities.insert(entity.name.clone(), entity);

        Ok(())
    }

    /// Builder-style registration
    pub fn with(mut self, entity: EntityMetadata) -> Result<Self> {
        self.register(entity)?;
        Ok(self)
    }

    /// Get an entity by name
    pub fn entity(&self, name: &str) -> Result<&EntityMetadata> {
        self.entities
            .get(name)
            .ok_or_else(|| QueryError::UnknownEntity(name.to_string()))
    }

    /// Check that every association targets a registered entity with resolvable keys
    pub fn validate(&self) -> Result<()> {
        for entity in self.entities() {
            for association in entity.associations() {
                let target = self.entity(&association.target).map_err(|_| {
                    QueryError::Schema(format!(
                        "Association {}.{} targets unknown entity {}",
                        entity.name, association.alias, association.target
                    ))
                })?;
                entity.key_column(association.source_key.as_deref())?;
                target.key_column(association.target_key.as_deref())?;
            }
        }
        Ok(())
    }

    /// Registered entities in registration order
    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.order.iter().filter_map(move |name| self.entities.get(name))
    }

    /// Generate CREATE TABLE SQL for all registered entities and link tables
    pub fn generate_ddl(&self, dialect: Dialect) -> Result<String> {
        let mut foreign_columns: HashMap<&str, Vec<(String, SqlType)>> = HashMap::new();
        let mut link_tables = Vec::new();

        for entity in self.entities() {
            for association in entity.associations() {
                let target = self.entity(&association.target)?;
                match &association.kind {
                    AssociationKind::BelongsTo => {
                        let key = target.key_attribute(association.target_key.as_deref())?;
                        foreign_columns
                            .entry(entity.name.as_str())
                            .or_default()
                            .push((association.foreign_key.clone(), key.sql_type.clone()));
                    }
                    AssociationKind::HasOne | AssociationKind::HasMany => {
                        let key = entity.key_attribute(association.source_key.as_deref())?;
                        foreign_columns
                            .entry(target.name.as_str())
                            .or_default()
                            .push((association.foreign_key.clone(), key.sql_type.clone()));
                    }
                    AssociationKind::BelongsToMany(link) => {
                        let source = entity.key_attribute(association.source_key.as_deref())?;
                        let destination = target.key_attribute(association.target_key.as_deref())?;
                        let seen = link_tables
                            .iter()
                            .any(|(l, _, _): &(&LinkTable, _, _)| l.table == link.table);
                        if !seen {
                            link_tables.push((
                                link,
                                source.sql_type.clone(),
                                destination.sql_type.clone(),
                            ));
                        }
                    }
                }
            }
        }

        let mut statements = Vec::new();

        for entity in self.entities() {
            let pk = entity.pk()?;
            let mut columns: Vec<String> = entity
                .attributes()
                .iter()
                .map(|attribute| {
                    let mut def = format!(
                        "    {} {}",
                        dialect.quote(&attribute.column),
                        attribute.sql_type.to_sql(dialect)
                    );
                    if attribute.name == pk.name {
                        def.push_str(" NOT NULL");
                    }
                    def
                })
                .collect();

            let mut known: Vec<&str> = entity
                .attributes()
                .iter()
                .map(|a| a.column.as_str())
                .collect();

            if let Some(extra) = foreign_columns.get(entity.name.as_str()) {
                for (column, sql_type) in extra {
                    if !known.contains(&column.as_str()) {
                        known.push(column);
                        columns.push(format!(
                            "    {} {}",
                            dialect.quote(column),
                            sql_type.to_sql(dialect)
                        ));
                    }
                }
            }

            if let Some(column) = entity.soft_delete_column() {
                if !known.contains(&column) {
                    columns.push(format!(
                        "    {} {}",
                        dialect.quote(column),
                        SqlType::Timestamp.to_sql(dialect)
                    ));
                }
            }

            columns.push(format!("    PRIMARY KEY ({})", dialect.quote(&pk.column)));

            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
                dialect.quote(&entity.table),
                columns.join(",\n")
            ));
        }

        for (link, source_type, target_type) in link_tables {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    {} {} NOT NULL,\n    {} {} NOT NULL,\n    PRIMARY KEY ({}, {})\n);",
                dialect.quote(&link.table),
                dialect.quote(&link.source_column),
                source_type.to_sql(dialect),
                dialect.quote(&link.target_column),
                target_type.to_sql(dialect),
                dialect.quote(&link.source_column),
                dialect.quote(&link.target_column),
            ));
        }

        Ok(statements.join("\n\n"))
    }
}

impl EntityMetadata {
    fn key_attribute(&self, key: Option<&str>) -> Result<&AttributeDef> {
        match key {
            Some(name) => self.attribute_def(name),
            None => self.pk(),
        }
    }
}
