//! SurrealDB-backed TableSink implementation
//!
//! Each published table becomes a schemaless SurrealDB table whose records
//! carry the row position and the row object.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::storage_traits::{validate_table_name, SinkResult, SinkTable, TableSink};

const NAMESPACE: &str = "medallion";
const DATABASE: &str = "main";

/// Environment variable holding the sink connection URL.
pub const SINK_URL_ENV: &str = "MEDALLION_SINK_URL";

/// One stored row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SinkRowRecord {
    position: i64,
    row: Value,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

/// SurrealDB-backed implementation of [`TableSink`].
pub struct SurrealTableSink {
    db: Surreal<Any>,
}

impl SurrealTableSink {
    /// Connect to `url` (`mem://`, `surrealkv://<path>`, `ws://...`) and
    /// select `medallion/main`.
    pub async fn connect(url: &str) -> SinkResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| SinkError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;

        info!(url = %url, "SurrealTableSink connected");
        Ok(Self { db })
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> SinkResult<Self> {
        Self::connect("mem://").await
    }

    /// Open (or create) an embedded database under `path`.
    pub async fn open_local(path: impl AsRef<Path>) -> SinkResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            SinkError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::connect(&format!("surrealkv://{}", path.display())).await
    }

    /// Connect to `MEDALLION_SINK_URL` if set, else open `default_path`
    /// locally.
    pub async fn from_env(default_path: impl AsRef<Path>) -> SinkResult<Self> {
        match std::env::var(SINK_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::connect(url.trim()).await,
            _ => Self::open_local(default_path).await,
        }
    }
}

#[async_trait]
impl TableSink for SurrealTableSink {
    async fn replace_table(&self, name: &str, table: &SinkTable) -> SinkResult<u64> {
        validate_table_name(name)?;

        let records: Vec<SinkRowRecord> = table
            .rows
            .iter()
            .enumerate()
            .map(|(position, row)| SinkRowRecord {
                position: position as i64,
                row: Value::Object(row.clone()),
            })
            .collect();
        let count = records.len() as u64;

        let insert = if records.is_empty() {
            String::new()
        } else {
            format!("INSERT INTO {name} $rows;")
        };
        let sql = format!(
            "BEGIN TRANSACTION;
             DEFINE TABLE IF NOT EXISTS {name} SCHEMALESS;
             DELETE {name};
             {insert}
             COMMIT TRANSACTION;"
        );

        self.db
            .query(sql)
            .bind(("rows", records))
            .await?
            .check()?;

        debug!(table = %name, rows = count, "Sink table replaced");
        Ok(count)
    }

    async fn count_rows(&self, name: &str) -> SinkResult<u64> {
        validate_table_name(name)?;
        let mut res = self
            .db
            .query(format!("SELECT count() AS count FROM {name} GROUP ALL"))
            .await?;
        let rows: Vec<CountRow> = res.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count))
    }

    async fn fetch_rows(&self, name: &str) -> SinkResult<Vec<Map<String, Value>>> {
        validate_table_name(name)?;
        let mut res = self
            .db
            .query(format!("SELECT position, row FROM {name} ORDER BY position ASC"))
            .await?;
        let records: Vec<SinkRowRecord> = res.take(0)?;
        records
            .into_iter()
            .map(|r| match r.row {
                Value::Object(map) => Ok(map),
                other => Err(SinkError::Serialization(format!(
                    "row {} is not an object: {other}",
                    r.position
                ))),
            })
            .collect()
    }
}
