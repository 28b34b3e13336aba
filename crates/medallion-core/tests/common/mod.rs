//! Shared fixtures for the medallion-core integration tests.
#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use medallion_core::{PipelineConfig, RetryPolicy, SourceLocator};

pub const HEADER: &str = "Date,Country,Confirmed,Recovered,Deaths";

/// Twelve countries over three days; country `C{i:02}` peaks at `i * 100`
/// confirmed cases on the last day.
pub fn clean_csv() -> String {
    let mut csv = format!("{HEADER}\n");
    for day in 1..=3 {
        for i in 1..=12i64 {
            let confirmed = i * 100 * day / 3;
            let deaths = confirmed / 20;
            let recovered = confirmed / 2;
            writeln!(csv, "2020-04-0{day},C{i:02},{confirmed},{recovered},{deaths}").unwrap();
        }
    }
    csv
}

/// Clean data plus one row with a blank country.
pub fn csv_with_blank_entity() -> String {
    let mut csv = clean_csv();
    csv.push_str("2020-04-03,,50,10,1\n");
    csv
}

/// Clean data plus one row whose outcomes exceed its confirmed count.
pub fn csv_with_inconsistent_outcomes() -> String {
    let mut csv = clean_csv();
    csv.push_str("2020-04-04,C01,10,8,5\n");
    csv
}

pub fn write_source(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("source.csv");
    std::fs::write(&path, contents).unwrap();
    path
}

/// Config reading `source` and storing layers under `root`, without retry
/// backoff.
pub fn config_for(source: &Path, root: &Path) -> PipelineConfig {
    PipelineConfig::default()
        .with_source(SourceLocator::Path(source.to_path_buf()))
        .with_storage_root(root)
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            multiplier: 2,
        })
}
