//! Statement-level error types, wrapping the engine taxonomy.

use strata::StrataError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Storage(#[from] StrataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog serialization: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("database {0} already exists")]
    DatabaseExists(String),

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("column {0} not found")]
    ColumnNotFound(String),

    #[error("index on {0}({1}) already exists")]
    IndexExists(String, String),

    #[error("index on {0}({1}) not found")]
    IndexNotFound(String, String),

    #[error("incompatible types: expected {lhs}, got {rhs}")]
    IncompatibleType { lhs: String, rhs: String },

    #[error("insert supplies {given} values for {expected} columns")]
    InvalidValueCount { expected: usize, given: usize },
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;
