//! Path resolution and join planning.
//!
//! A [`JoinPlan`] belongs to one compilation. Resolving a dotted path walks the
//! associations from the root entity, joining each association once and reusing
//! its alias on every later resolution of the same path.

use crate::builder::{Condition, JoinType};
use crate::error::{QueryError, Result};
use crate::operators::{Operator, PredicateSink};
use crate::query::QueryPair;
use crate::schema::{AssociationKind, AssociationMeta, EntityMetadata, Schema, SqlType};
use serde_json::Value;
use std::collections::HashMap;
use tracing::trace;

/// Path segment standing for the primary key of the current entity
pub const ID_SEGMENT: &str = "$id";

/// Suffix marking an association hop as optional (always LEFT joined)
pub const OPTIONAL_SUFFIX: char = '?';

/// How association hops are joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMode {
    /// Every hop is a LEFT join
    #[default]
    Left,
    /// Single-valued hops are INNER joins, to-many hops LEFT joins
    Inner,
    /// Every hop is an INNER join
    ForceInner,
}

/// Result of resolving a path
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// `alias.column`
    pub column: String,
    /// Name of the entity owning the column
    pub entity: String,
    /// Type of the column; `None` for association tails
    pub sql_type: Option<SqlType>,
    /// A to-many association was crossed
    pub is_to_many: bool,
    /// The final segment named an association
    pub is_association_tail: bool,
}

/// A predicate to be ANDed into the ON clause of the join for its parent path
#[derive(Debug, Clone)]
pub struct ScopedPredicate {
    pub path: String,
    pub operator: Operator,
    pub value: Value,
    pub parameter: String,
    pub applied: bool,
}

impl ScopedPredicate {
    pub fn new(
        path: impl Into<String>,
        operator: Operator,
        value: Value,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            operator,
            value,
            parameter: parameter.into(),
            applied: false,
        }
    }

    fn split(&self) -> Option<(String, &str)> {
        let (parent, leaf) = self.path.rsplit_once('.')?;
        Some((normalize_path(parent), leaf))
    }
}

#[derive(Debug, Clone)]
struct Joined {
    alias: String,
    left: bool,
}

/// Join plan of one compilation
#[derive(Debug, Clone)]
pub struct JoinPlan {
    root_alias: String,
    joined: HashMap<String, Joined>,
    counter: usize,
}

impl JoinPlan {
    /// Create a plan and allocate the root alias
    pub fn new(root: &EntityMetadata) -> Self {
        let mut plan = Self {
            root_alias: String::new(),
            joined: HashMap::new(),
            counter: 0,
        };
        plan.root_alias = plan.allocate(&root.name);
        plan
    }

    pub fn root_alias(&self) -> &str {
        &self.root_alias
    }

    /// Alias of an already joined path
    pub fn alias_of(&self, path: &str) -> Option<&str> {
        self.joined.get(&normalize_path(path)).map(|j| j.alias.as_str())
    }

    /// Number of joined association paths
    pub fn len(&self) -> usize {
        self.joined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }

    fn allocate(&mut self, name: &str) -> String {
        self.counter += 1;
        let base: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("{}_{}", base, self.counter)
    }

    /// Resolve `path` from `root`, adding any missing joins to `query`
    pub fn resolve(
        &mut self,
        schema: &Schema,
        root: &EntityMetadata,
        query: &mut QueryPair,
        path: &str,
        mode: JoinMode,
        mut scoped: Option<&mut ScopedPredicate>,
    ) -> Result<ResolvedPath> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut entity = root;
        let mut alias = self.root_alias.clone();
        let mut real_path = String::new();
        let mut is_to_many = false;
        let mut left = false;

        for (index, segment) in segments.iter().enumerate() {
            let last = index + 1 == segments.len();
            let optional = segment.ends_with(OPTIONAL_SUFFIX);
            let name = segment.trim_end_matches(OPTIONAL_SUFFIX);

            let association = match entity.find_association(name) {
                Some(association) => association,
                None if last => {
                    let attribute = if name == ID_SEGMENT {
                        entity.pk()?
                    } else {
                        entity.attribute_def(name)?
                    };
                    return Ok(ResolvedPath {
                        column: format!("{}.{}", alias, attribute.column),
                        entity: entity.name.clone(),
                        sql_type: Some(attribute.sql_type.clone()),
                        is_to_many,
                        is_association_tail: false,
                    });
                }
                None => {
                    return Err(QueryError::UnknownAssociationSegment {
                        segment: name.to_string(),
                        entity: entity.name.clone(),
                    })
                }
            };

            let to_many = association.kind.is_to_many();
            is_to_many |= to_many;
            // a to-one tail is selectable only below a to-many hop
            if last && !is_to_many {
                return Err(QueryError::SelectedWholeAssociation(path.to_string()));
            }

            let target = schema.entity(&association.target)?;
            if !real_path.is_empty() {
                real_path.push('.');
            }
            real_path.push_str(name);

            let hop_left = left
                || mode == JoinMode::Left
                || optional
                || association.kind == AssociationKind::HasOne
                || (to_many && mode == JoinMode::Inner);

            alias = match self.joined.get(&real_path) {
                Some(joined) => {
                    left = joined.left;
                    joined.alias.clone()
                }
                None => {
                    left = hop_left;
                    let join_type = if left { JoinType::Left } else { JoinType::Inner };
                    let child = self.allocate(&association.alias);
                    let mut on = join_association(
                        query,
                        entity,
                        &alias,
                        association,
                        target,
                        &child,
                        join_type,
                    )?;

                    if let Some(column) = target.soft_delete_column() {
                        on.push(Condition::is_null(format!("{}.{}", child, column)));
                    }

                    if let Some(predicate) = scoped.as_deref_mut() {
                        on.extend(scope_predicate(predicate, &real_path, target, &child)?);
                    }

                    trace!(
                        path = %real_path,
                        alias = %child,
                        join = %join_type,
                        "joined association"
                    );
                    query.join(join_type, &target.table, &child, Condition::and(on));
                    self.joined.insert(
                        real_path.clone(),
                        Joined {
                            alias: child.clone(),
                            left,
                        },
                    );
                    child
                }
            };

            entity = target;

            if last {
                let pk = entity.pk()?;
                return Ok(ResolvedPath {
                    column: format!("{}.{}", alias, pk.column),
                    entity: entity.name.clone(),
                    sql_type: Some(pk.sql_type.clone()),
                    is_to_many,
                    is_association_tail: true,
                });
            }
        }

        Err(QueryError::UnknownAttribute {
            attribute: path.to_string(),
            entity: root.name.clone(),
        })
    }
}

/// Conditions joining `child` to `parent`; many-to-many adds the link join itself
fn join_association(
    query: &mut QueryPair,
    parent: &EntityMetadata,
    parent_alias: &str,
    association: &AssociationMeta,
    target: &EntityMetadata,
    child: &str,
    join_type: JoinType,
) -> Result<Vec<Condition>> {
    let source_key = parent.key_column(association.source_key.as_deref())?;
    let target_key = target.key_column(association.target_key.as_deref())?;

    let condition = match &association.kind {
        AssociationKind::BelongsTo => Condition::columns_eq(
            format!("{}.{}", parent_alias, association.foreign_key),
            format!("{}.{}", child, target_key),
        ),
        AssociationKind::HasOne | AssociationKind::HasMany => Condition::columns_eq(
            format!("{}.{}", parent_alias, source_key),
            format!("{}.{}", child, association.foreign_key),
        ),
        AssociationKind::BelongsToMany(link) => {
            let link_alias = format!("{}_{}", parent_alias, child);
            query.join(
                join_type,
                &link.table,
                &link_alias,
                Condition::columns_eq(
                    format!("{}.{}", parent_alias, source_key),
                    format!("{}.{}", link_alias, link.source_column),
                ),
            );
            Condition::columns_eq(
                format!("{}.{}", link_alias, link.target_column),
                format!("{}.{}", child, target_key),
            )
        }
    };

    Ok(vec![condition])
}

/// Conditions of a scoped predicate whose parent path is the join being created
fn scope_predicate(
    predicate: &mut ScopedPredicate,
    joined_path: &str,
    target: &EntityMetadata,
    alias: &str,
) -> Result<Vec<Condition>> {
    if predicate.applied {
        return Ok(Vec::new());
    }
    let Some((parent, leaf)) = predicate.split() else {
        return Ok(Vec::new());
    };
    if parent != joined_path {
        return Ok(Vec::new());
    }

    let attribute = if leaf == ID_SEGMENT {
        target.pk()?
    } else {
        target.attribute_def(leaf)?
    };

    let mut sink = PredicateSink::new();
    predicate.operator.apply(
        &mut sink,
        &format!("{}.{}", alias, attribute.column),
        &predicate.value,
        &predicate.parameter,
    )?;
    predicate.applied = true;

    Ok(sink.into_conditions())
}

/// Strip optional markers from every segment
pub fn normalize_path(path: &str) -> String {
    path.split('.')
        .map(|segment| segment.trim_end_matches(OPTIONAL_SUFFIX))
        .collect::<Vec<_>>()
        .join(".")
}

/// Join a prefix and a path with a dot
pub fn prefixed(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}.{}", prefix, path)
    }
}
