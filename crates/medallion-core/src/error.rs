use std::path::PathBuf;

use thiserror::Error;

use crate::aggregate::AggregationError;
use crate::fetch::FetchError;
use crate::store::StoreError;
use crate::transform::TransformError;
use medallion_sink::SinkError;

/// Top-level error for pipeline operations.
///
/// A run that aborts on a stage failure is reported through
/// [`RunReport`](crate::pipeline::RunReport), not through this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error(
        "another run holds the storage lock at {}; if no run is active, delete that file",
        path.display()
    )]
    Locked { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
