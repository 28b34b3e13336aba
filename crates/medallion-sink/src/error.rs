//! Error types for medallion-sink

use thiserror::Error;

/// Errors that can occur while publishing to a sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// Database connection error
    #[error("Sink connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Sink query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Table name that cannot be used as an identifier
    #[error("Invalid table name: {name:?}")]
    InvalidTableName { name: String },
}

impl From<surrealdb::Error> for SinkError {
    fn from(err: surrealdb::Error) -> Self {
        SinkError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Serialization(err.to_string())
    }
}
