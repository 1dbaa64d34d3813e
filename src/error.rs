//! Error types for vector collections

use thiserror::Error;

/// Result type alias for collection operations
pub type Result<T> = std::result::Result<T, VecsError>;

/// Errors describing the physical layout of a collection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Collection already exists: {name}")]
    CollectionAlreadyExists { name: String },

    #[error("Collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("Relation {name} exists but is not a vector collection")]
    NotACollection { name: String },

    #[error("Mismatched dimension for collection {name}: stored {stored}, requested {requested}")]
    MismatchedDimension {
        name: String,
        stored: usize,
        requested: usize,
    },
}

/// Errors raised while building an ANN index
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexBuildError {
    #[error("Index build on {collection} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        collection: String,
        attempts: u32,
        last_error: String,
    },
}

/// Error types that can occur in collection operations
#[derive(Error, Debug)]
pub enum VecsError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Invalid argument: {0}")]
    Arg(String),

    #[error("Invalid filter: {0}")]
    Filter(String),

    #[error("Index build error: {0}")]
    IndexBuild(#[from] IndexBuildError),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: {reason}")]
    InvalidVector { reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl VecsError {
    pub(crate) fn arg(msg: impl Into<String>) -> Self {
        VecsError::Arg(msg.into())
    }

    pub(crate) fn filter(msg: impl Into<String>) -> Self {
        VecsError::Filter(msg.into())
    }

    /// Malformed arguments, including vectors of the wrong dimension.
    pub fn is_arg_error(&self) -> bool {
        matches!(
            self,
            VecsError::Arg(_) | VecsError::DimensionMismatch { .. } | VecsError::InvalidVector { .. }
        )
    }

    pub fn is_filter_error(&self) -> bool {
        matches!(self, VecsError::Filter(_))
    }

    pub fn is_schema_error(&self) -> bool {
        matches!(self, VecsError::Schema(_))
    }
}
