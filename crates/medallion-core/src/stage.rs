//! Pipeline stage definitions and per-stage reports.

use serde::{Deserialize, Serialize};

use crate::store::Layer;

/// Stages of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch the raw source and persist bronze.
    Extract,

    /// Derive silver from bronze.
    Transform,

    /// Run the validation gate.
    Validate,

    /// Reduce to gold.
    Aggregate,

    /// Replace the sink table with gold.
    Publish,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Validate => "validate",
            Stage::Aggregate => "aggregate",
            Stage::Publish => "publish",
        }
    }

    /// Layer this stage persists, if any.
    pub fn output_layer(&self) -> Option<Layer> {
        match self {
            Stage::Extract => Some(Layer::Bronze),
            Stage::Transform => Some(Layer::Silver),
            Stage::Aggregate => Some(Layer::Gold),
            Stage::Validate | Stage::Publish => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of one stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,

    /// Rows produced (or, for validation, rows checked).
    pub rows: usize,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<Layer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageReport {
    pub fn succeeded(stage: Stage, rows: usize, duration_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Succeeded,
            rows,
            duration_ms,
            layer: stage.output_layer(),
            error: None,
        }
    }

    pub fn failed(stage: Stage, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            rows: 0,
            duration_ms,
            layer: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            rows: 0,
            duration_ms: 0,
            layer: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Extract.name(), "extract");
        assert_eq!(Stage::Validate.to_string(), "validate");
        assert_eq!(Stage::Publish.name(), "publish");
    }

    #[test]
    fn test_output_layers() {
        assert_eq!(Stage::Extract.output_layer(), Some(Layer::Bronze));
        assert_eq!(Stage::Aggregate.output_layer(), Some(Layer::Gold));
        assert_eq!(Stage::Validate.output_layer(), None);
    }

    #[test]
    fn test_report_constructors() {
        let ok = StageReport::succeeded(Stage::Transform, 12, 3);
        assert!(ok.is_success());
        assert_eq!(ok.layer, Some(Layer::Silver));

        let failed = StageReport::failed(Stage::Extract, 9, "boom");
        assert_eq!(failed.status, StageStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let skipped = StageReport::skipped(Stage::Validate);
        assert_eq!(skipped.status, StageStatus::Skipped);
        assert!(!skipped.is_success());
    }

    #[test]
    fn test_report_serializes_without_empty_fields() {
        let json = serde_json::to_value(StageReport::skipped(Stage::Validate)).unwrap();
        assert_eq!(json["stage"], "validate");
        assert_eq!(json["status"], "skipped");
        assert!(json.get("error").is_none());
    }
}
