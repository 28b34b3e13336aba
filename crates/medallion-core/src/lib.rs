//! Medallion Core
//!
//! Staged bronze/silver/gold pipeline engine:
//! - Fetches a raw CSV dataset (URL or path) with bounded retry
//! - Persists each layer as a Parquet snapshot
//! - Gates aggregation on data-quality predicates
//! - Reduces the validated data to a ranked per-entity gold table

pub mod aggregate;
pub mod config;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod obs;
pub mod pipeline;
pub mod stage;
pub mod store;
pub mod summary;
pub mod table;
pub mod telemetry;
pub mod transform;
pub mod validate;

pub use aggregate::{aggregate, AggregateRecord, AggregationError, DEFAULT_TOP_N};
pub use config::{GateInput, PipelineConfig};
pub use error::{PipelineError, Result};
pub use fetch::{parse_csv, FetchError, RetryPolicy, SourceFetcher, SourceLocator};
pub use lock::RunLock;
pub use obs::{ObservedEvent, RecordingObserver, RunObserver, TracingObserver};
pub use pipeline::{AbortReason, Pipeline, RunOutcome, RunReport, RunState};
pub use stage::{Stage, StageReport, StageStatus};
pub use store::{Layer, LayerStore, LayerWrite, StoreError};
pub use summary::{GoldSummary, MortalityRow, SummaryView};
pub use table::{Column, ColumnValues, DataType, Table, TableError};
pub use telemetry::init_tracing;
pub use transform::{transform, TransformError, TransformMode};
pub use validate::{GateConfig, Predicate, PredicateFailure, ValidationGate, ValidationVerdict};
