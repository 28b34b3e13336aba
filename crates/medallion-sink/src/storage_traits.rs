//! Sink trait definitions
//!
//! `TableSink` is the relational store port: it replaces (or creates) a
//! named table from a dataset and reads it back for verification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SinkError;

/// Result type for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Longest accepted table name.
const MAX_TABLE_NAME_LEN: usize = 64;

/// A dataset handed to a sink: column names plus one JSON object per row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkTable {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl SinkTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Check that `name` is safe to splice into a query as a table identifier:
/// ASCII letters, digits and `_`, not starting with a digit.
pub fn validate_table_name(name: &str) -> SinkResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && name.len() <= MAX_TABLE_NAME_LEN {
        Ok(())
    } else {
        Err(SinkError::InvalidTableName {
            name: name.to_string(),
        })
    }
}

/// Relational store receiving published tables.
///
/// Guarantees:
/// - `replace_table` creates the table if absent and leaves exactly the
///   given rows in it, in order.
/// - `count_rows` and `fetch_rows` on a table that was never written
///   report no rows.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Replace every row of `name` with `table`. Returns rows written.
    async fn replace_table(&self, name: &str, table: &SinkTable) -> SinkResult<u64>;

    /// Number of rows currently in `name`.
    async fn count_rows(&self, name: &str) -> SinkResult<u64>;

    /// Rows of `name` in the order they were written.
    async fn fetch_rows(&self, name: &str) -> SinkResult<Vec<Map<String, Value>>>;
}
