//! Medallion Sink: relational store port for published gold tables
//!
//! ## Key Components
//!
//! - `TableSink`: replace-or-create a table from a dataset, read it back
//! - `MemoryTableSink`: in-memory fake for tests
//! - `SurrealTableSink`: SurrealDB backend (`mem://`, `surrealkv://`, remote)

mod error;
pub mod fakes;
pub mod storage_traits;
pub mod surreal_sink;

pub use error::SinkError;
pub use fakes::MemoryTableSink;
pub use storage_traits::{validate_table_name, SinkResult, SinkTable, TableSink};
pub use surreal_sink::{SurrealTableSink, SINK_URL_ENV};
