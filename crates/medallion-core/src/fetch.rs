//! Source fetcher: pulls the raw CSV dataset into a bronze [`Table`].
//!
//! Remote sources are fetched over HTTP with a per-attempt timeout and a
//! bounded exponential-backoff retry. Local paths are read directly. Either
//! way the payload is parsed completely before a table is returned.

use std::io::Cursor;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType as ArrowType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::table::{Column, Table, CONFIRMED, DEATHS, ENTITY, RECOVERED, TIMESTAMP};

/// Header spellings accepted for each canonical column, compared
/// case-insensitively.
const COLUMN_ALIASES: [(&str, &[&str]); 5] = [
    (ENTITY, &["entity", "country", "country/region", "country_region"]),
    (TIMESTAMP, &["timestamp", "date"]),
    (CONFIRMED, &["confirmed"]),
    (RECOVERED, &["recovered"]),
    (DEATHS, &["deaths"]),
];

/// Where the raw dataset lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum SourceLocator {
    Url(String),
    Path(PathBuf),
}

impl SourceLocator {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            SourceLocator::Url(raw.to_string())
        } else if let Some(path) = raw.strip_prefix("file://") {
            SourceLocator::Path(PathBuf::from(path))
        } else {
            SourceLocator::Path(PathBuf::from(raw))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SourceLocator::Url(_))
    }
}

impl FromStr for SourceLocator {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SourceLocator::parse(s))
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceLocator::Url(url) => f.write_str(url),
            SourceLocator::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after each further failure.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

/// Fetch failure taxonomy.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV: {0}")]
    Csv(String),

    #[error("source is missing required column '{0}'")]
    MissingColumn(String),

    #[error("row {row}: cannot parse {column} value '{value}'")]
    Parse {
        row: usize,
        column: String,
        value: String,
    },

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transport-level failures may succeed on a later attempt; a payload
    /// that failed to parse will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport { .. } | FetchError::Timeout { .. } | FetchError::Status { .. }
        )
    }
}

/// Retrieves and parses the raw dataset.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SourceFetcher {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("medallion/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            retry,
            timeout,
        })
    }

    /// Fetch and parse `locator`, retrying transient failures.
    ///
    /// Never returns a partially populated table. Cancellation interrupts both
    /// an in-flight attempt and a backoff wait.
    pub async fn fetch(
        &self,
        locator: &SourceLocator,
        cancel: &CancellationToken,
    ) -> Result<Table, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                r = self.fetch_once(locator) => r,
            };

            match result {
                Ok(table) => {
                    info!(
                        source = %locator,
                        attempt,
                        rows = table.num_rows(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Fetched source dataset"
                    );
                    return Ok(table);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.retry.backoff_for(attempt);
                    warn!(
                        source = %locator,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Fetch attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) if e.is_retryable() => {
                    return Err(FetchError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, locator: &SourceLocator) -> Result<Table, FetchError> {
        let bytes = match locator {
            SourceLocator::Url(url) => self.download(url).await?,
            SourceLocator::Path(path) => {
                tokio::fs::read(path).await.map_err(|source| FetchError::Io {
                    path: path.clone(),
                    source,
                })?
            }
        };
        debug!(source = %locator, bytes = bytes.len(), "Read source payload");
        parse_csv(&bytes)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let request = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| FetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = response.bytes().await.map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            Ok(body.to_vec())
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            })?
    }
}

/// Parse a headed CSV payload into the canonical bronze schema:
/// `entity, timestamp, confirmed, recovered, deaths`.
///
/// Blank cells become nulls. Columns outside the canonical set are dropped.
pub fn parse_csv(bytes: &[u8]) -> Result<Table, FetchError> {
    let csv_err = |e: arrow::error::ArrowError| FetchError::Csv(e.to_string());

    let format = Format::default().with_header(true);
    let (inferred, _) = format
        .infer_schema(Cursor::new(bytes), Some(0))
        .map_err(csv_err)?;

    // Read every column as text; typing happens below with row-level errors.
    let fields: Vec<Field> = inferred
        .fields()
        .iter()
        .map(|f| Field::new(f.name(), ArrowType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let positions = COLUMN_ALIASES
        .iter()
        .map(|(canonical, aliases)| {
            schema
                .fields()
                .iter()
                .position(|f| {
                    let header = f.name().trim().to_lowercase();
                    aliases.contains(&header.as_str())
                })
                .ok_or_else(|| FetchError::MissingColumn((*canonical).to_string()))
        })
        .collect::<Result<Vec<usize>, _>>()?;

    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .build(Cursor::new(bytes))
        .map_err(csv_err)?;
    let batches = reader.collect::<Result<Vec<RecordBatch>, _>>().map_err(csv_err)?;
    let text = Table::from_record_batches(&schema, &batches)
        .map_err(|e| FetchError::Csv(e.to_string()))?;
    let raw = |position: usize| text_cells(&text, position);

    let entity = raw(positions[0])?
        .iter()
        .map(|v| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string))
        .collect();
    let timestamp = parse_column(raw(positions[1])?, TIMESTAMP, parse_date)?;
    let confirmed = parse_column(raw(positions[2])?, CONFIRMED, parse_int)?;
    let recovered = parse_column(raw(positions[3])?, RECOVERED, parse_int)?;
    let deaths = parse_column(raw(positions[4])?, DEATHS, parse_int)?;

    Table::new(vec![
        Column::utf8(ENTITY, entity),
        Column::date(TIMESTAMP, timestamp),
        Column::int64(CONFIRMED, confirmed),
        Column::int64(RECOVERED, recovered),
        Column::int64(DEATHS, deaths),
    ])
    .map_err(|e| FetchError::Csv(e.to_string()))
}

fn text_cells(text: &Table, position: usize) -> Result<&[Option<String>], FetchError> {
    text.strings(text.columns()[position].name())
        .map_err(|e| FetchError::Csv(e.to_string()))
}

fn parse_column<T>(
    cells: &[Option<String>],
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<Vec<Option<T>>, FetchError> {
    cells
        .iter()
        .enumerate()
        .map(|(index, cell)| match cell.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => parse(value).map(Some).ok_or_else(|| FetchError::Parse {
                // 1-based, counting the header line.
                row: index + 2,
                column: column.to_string(),
                value: value.to_string(),
            }),
        })
        .collect()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

fn parse_int(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(f))
            .map(|f| f as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Date,Country,Confirmed,Recovered,Deaths\n\
        2020-01-22,Afghanistan,0,0,0\n\
        2020-01-23,Afghanistan,5,1,\n\
        2020-01-22,Albania,2,0,1\n";

    #[test]
    fn test_locator_parse() {
        assert_eq!(
            SourceLocator::parse("https://example.com/a.csv"),
            SourceLocator::Url("https://example.com/a.csv".into())
        );
        assert_eq!(
            SourceLocator::parse("file:///tmp/a.csv"),
            SourceLocator::Path(PathBuf::from("/tmp/a.csv"))
        );
        assert_eq!(
            SourceLocator::parse("data/raw.csv"),
            SourceLocator::Path(PathBuf::from("data/raw.csv"))
        );
        assert!(SourceLocator::parse("http://x").is_remote());
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_parse_csv_maps_headers_and_types() {
        let table = parse_csv(SAMPLE.as_bytes()).unwrap();
        assert_eq!(
            table.column_names(),
            vec![ENTITY, TIMESTAMP, CONFIRMED, RECOVERED, DEATHS]
        );
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.strings(ENTITY).unwrap()[2].as_deref(), Some("Albania"));
        assert_eq!(
            table.dates(TIMESTAMP).unwrap()[1],
            NaiveDate::from_ymd_opt(2020, 1, 23)
        );
        assert_eq!(table.ints(CONFIRMED).unwrap(), &[Some(0), Some(5), Some(2)]);
        assert_eq!(table.ints(DEATHS).unwrap(), &[Some(0), None, Some(1)]);
    }

    #[test]
    fn test_parse_csv_header_case_and_order_insensitive() {
        let csv = "deaths,CONFIRMED,recovered,entity,timestamp\n1,10,2,A,2021-05-01\n";
        let table = parse_csv(csv.as_bytes()).unwrap();
        assert_eq!(table.ints(CONFIRMED).unwrap(), &[Some(10)]);
        assert_eq!(table.ints(DEATHS).unwrap(), &[Some(1)]);
        assert_eq!(table.strings(ENTITY).unwrap()[0].as_deref(), Some("A"));
    }

    #[test]
    fn test_parse_csv_missing_column() {
        let csv = "Date,Country,Confirmed,Deaths\n2020-01-22,A,1,0\n";
        match parse_csv(csv.as_bytes()) {
            Err(FetchError::MissingColumn(column)) => assert_eq!(column, RECOVERED),
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_csv_bad_cell_reports_row() {
        let csv = "Date,Country,Confirmed,Recovered,Deaths\n2020-01-22,A,1,0,0\n2020-01-23,A,many,0,0\n";
        match parse_csv(csv.as_bytes()) {
            Err(FetchError::Parse { row, column, value }) => {
                assert_eq!(row, 3);
                assert_eq!(column, CONFIRMED);
                assert_eq!(value, "many");
            }
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_csv_rejects_out_of_range_count() {
        let csv = "Date,Country,Confirmed,Recovered,Deaths\n2020-01-01,A,1e30,0,0\n";
        match parse_csv(csv.as_bytes()) {
            Err(FetchError::Parse { row, column, value }) => {
                assert_eq!(row, 2);
                assert_eq!(column, CONFIRMED);
                assert_eq!(value, "1e30");
            }
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_int_accepts_integral_floats() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-3"), Some(-3));
        assert_eq!(parse_int("7.0"), Some(7));
        assert_eq!(parse_int("7.5"), None);
        assert_eq!(parse_int("1e30"), None);
        assert_eq!(parse_int("-1e19"), None);
        assert_eq!(parse_int("inf"), None);
        assert_eq!(parse_int("NaN"), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Status {
            url: "u".into(),
            status: 503
        }
        .is_retryable());
        assert!(!FetchError::MissingColumn("x".into()).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        std::fs::write(&path, SAMPLE).unwrap();

        let fetcher = SourceFetcher::new(RetryPolicy::none(), Duration::from_secs(5)).unwrap();
        let table = fetcher
            .fetch(&SourceLocator::Path(path), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(table.num_rows(), 3);
    }

    #[tokio::test]
    async fn test_fetch_missing_file_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = SourceFetcher::new(RetryPolicy::default(), Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(
                &SourceLocator::Path(dir.path().join("absent.csv")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[tokio::test]
    async fn test_fetch_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let fetcher = SourceFetcher::new(RetryPolicy::none(), Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(&SourceLocator::Path(PathBuf::from("whatever.csv")), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }
}
