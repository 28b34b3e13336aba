//! In-memory fake for `TableSink` (testing only)

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::storage_traits::{validate_table_name, SinkResult, SinkTable, TableSink};

/// In-memory sink backed by a `HashMap<table name, SinkTable>`.
#[derive(Debug, Default)]
pub struct MemoryTableSink {
    tables: Mutex<HashMap<String, SinkTable>>,
}

impl MemoryTableSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of tables written so far, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TableSink for MemoryTableSink {
    async fn replace_table(&self, name: &str, table: &SinkTable) -> SinkResult<u64> {
        validate_table_name(name)?;
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.insert(name.to_string(), table.clone());
        Ok(table.rows.len() as u64)
    }

    async fn count_rows(&self, name: &str) -> SinkResult<u64> {
        validate_table_name(name)?;
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.get(name).map_or(0, |t| t.rows.len() as u64))
    }

    async fn fetch_rows(&self, name: &str) -> SinkResult<Vec<Map<String, Value>>> {
        validate_table_name(name)?;
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.get(name).map(|t| t.rows.clone()).unwrap_or_default())
    }
}
