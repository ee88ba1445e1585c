use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Undefined projection `{0}`")]
    UnknownProjection(String),

    #[error("Undefined sort `{0}`")]
    UnknownSort(String),

    #[error("Criteria named `{0}` not found")]
    UnknownCriterion(String),

    #[error("Association `{segment}` not found on {entity}")]
    UnknownAssociationSegment { segment: String, entity: String },

    #[error("Attribute `{attribute}` not found on {entity}")]
    UnknownAttribute { attribute: String, entity: String },

    #[error("Can't select the entire association `{0}`")]
    SelectedWholeAssociation(String),

    #[error("To-many association `{0}` can only be selected as a column when its model is cached")]
    UngroupedToManyWithoutCache(String),

    #[error("Operator {0} is not supported")]
    UnsupportedOperator(String),

    #[error("Invalid page parameters: {0}")]
    InvalidPageParameters(String),

    #[error("Invalid value for criterion `{parameter}`: {reason}")]
    InvalidCriterionValue { parameter: String, reason: String },

    #[error("Model not registered: {0}")]
    UnknownModel(String),

    #[error("Entity not registered: {0}")]
    UnknownEntity(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl QueryError {
    pub(crate) fn invalid_value(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::InvalidCriterionValue {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}
