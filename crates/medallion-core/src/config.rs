//! Pipeline run configuration and identity.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregate::DEFAULT_TOP_N;
use crate::error::PipelineError;
use crate::fetch::{RetryPolicy, SourceLocator};
use crate::store::{Layer, DEFAULT_DATASET};
use crate::transform::TransformMode;
use crate::validate::GateConfig;

pub const DEFAULT_SOURCE_URL: &str =
    "https://raw.githubusercontent.com/datasets/covid-19/master/data/countries-aggregated.csv";
pub const DEFAULT_STORAGE_ROOT: &str = "data";
pub const DEFAULT_SINK_TABLE: &str = "processed_data";
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

pub const ENV_SOURCE: &str = "MEDALLION_SOURCE";
pub const ENV_ROOT: &str = "MEDALLION_ROOT";
pub const ENV_TRANSFORM: &str = "MEDALLION_TRANSFORM";
pub const ENV_TOP_N: &str = "MEDALLION_TOP_N";
pub const ENV_FETCH_TIMEOUT_SECS: &str = "MEDALLION_FETCH_TIMEOUT_SECS";

/// Which layer the validation gate evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateInput {
    Bronze,
    #[default]
    Silver,
}

impl GateInput {
    pub fn layer(&self) -> Layer {
        match self {
            GateInput::Bronze => Layer::Bronze,
            GateInput::Silver => Layer::Silver,
        }
    }
}

impl FromStr for GateInput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bronze" => Ok(GateInput::Bronze),
            "silver" => Ok(GateInput::Silver),
            other => Err(format!("unknown gate input '{other}' (expected bronze or silver)")),
        }
    }
}

/// Everything that determines what a run does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceLocator,

    /// Directory holding the layer files, lock and run log.
    pub storage_root: PathBuf,

    /// File name prefix for layer snapshots.
    pub dataset: String,

    pub transform_mode: TransformMode,

    /// When false the gate is skipped and silver goes straight to aggregation.
    pub with_validation: bool,

    /// Validate the persisted snapshot instead of the in-memory table.
    pub re_validate: bool,

    pub gate_input: GateInput,

    pub gate: GateConfig,

    /// Entities kept in the gold layer.
    pub top_n: usize,

    pub retry: RetryPolicy,

    pub fetch_timeout_secs: u64,

    /// Keep a timestamped copy of every layer write.
    pub keep_history: bool,

    /// Sink table gold is published to.
    pub sink_table: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceLocator::Url(DEFAULT_SOURCE_URL.to_string()),
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            dataset: DEFAULT_DATASET.to_string(),
            transform_mode: TransformMode::default(),
            with_validation: true,
            re_validate: false,
            gate_input: GateInput::default(),
            gate: GateConfig::standard(),
            top_n: DEFAULT_TOP_N,
            retry: RetryPolicy::default(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            keep_history: false,
            sink_table: DEFAULT_SINK_TABLE.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `MEDALLION_*` environment variables.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `MEDALLION_*` keys. Blank values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(source) = get(ENV_SOURCE) {
            config.source = SourceLocator::parse(&source);
        }
        if let Some(root) = get(ENV_ROOT) {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(mode) = get(ENV_TRANSFORM) {
            config.transform_mode = mode
                .parse()
                .map_err(|e| PipelineError::Config(format!("{ENV_TRANSFORM}: {e}")))?;
        }
        if let Some(top_n) = get(ENV_TOP_N) {
            config.top_n = top_n.trim().parse().map_err(|e| {
                PipelineError::Config(format!("{ENV_TOP_N}: invalid value '{top_n}': {e}"))
            })?;
        }
        if let Some(secs) = get(ENV_FETCH_TIMEOUT_SECS) {
            config.fetch_timeout_secs = secs.trim().parse().map_err(|e| {
                PipelineError::Config(format!(
                    "{ENV_FETCH_TIMEOUT_SECS}: invalid value '{secs}': {e}"
                ))
            })?;
        }
        Ok(config)
    }

    pub fn with_source(mut self, source: SourceLocator) -> Self {
        self.source = source;
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn with_transform_mode(mut self, mode: TransformMode) -> Self {
        self.transform_mode = mode;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.with_validation = enabled;
        self
    }

    pub fn with_re_validate(mut self, enabled: bool) -> Self {
        self.re_validate = enabled;
        self
    }

    pub fn with_gate_input(mut self, input: GateInput) -> Self {
        self.gate_input = input;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }

    pub fn with_sink_table(mut self, table: impl Into<String>) -> Self {
        self.sink_table = table.into();
        self
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));
        if self.top_n == 0 {
            return invalid("top_n must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.fetch_timeout_secs == 0 {
            return invalid("fetch_timeout_secs must be at least 1".into());
        }
        if self.dataset.is_empty()
            || self
                .dataset
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return invalid(format!(
                "dataset '{}' must be non-empty and contain only letters, digits, '_' or '-'",
                self.dataset
            ));
        }
        if self.with_validation && self.gate.predicates.is_empty() {
            return invalid("validation is enabled but the gate has no predicates".into());
        }
        medallion_sink::validate_table_name(&self.sink_table)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(())
    }

    /// SHA-256 of the canonical JSON form. Identifies the run configuration.
    pub fn config_digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}
