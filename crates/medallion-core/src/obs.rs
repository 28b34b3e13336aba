//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - [`RunObserver`], the port the orchestrator reports transitions through
//! - [`TracingObserver`] (default) and [`RecordingObserver`] (tests)
//! - `emit_*` functions for the individual lifecycle events
//! - [`run_span`] for tagging everything a run logs with its `run_id`

use std::sync::Mutex;

use tracing::{info, warn};

use crate::pipeline::{RunReport, RunState};
use crate::stage::{StageReport, StageStatus};
use crate::validate::ValidationVerdict;

/// Span tagged with the run id. Attach it to the run future with
/// [`tracing::Instrument`].
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("medallion.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, source: &str, config_digest: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        source = %source,
        config_digest = %config_digest,
        "Pipeline run started"
    );
}

pub fn emit_state_changed(run_id: &str, from: RunState, to: RunState) {
    info!(
        event = "run.state_changed",
        run_id = %run_id,
        from = %from,
        to = %to,
        "Run state {} -> {}", from, to
    );
}

/// Emit event: stage finished. Failures are logged at warn.
pub fn emit_stage_finished(run_id: &str, report: &StageReport) {
    match report.status {
        StageStatus::Failed => warn!(
            event = "stage.failed",
            run_id = %run_id,
            stage = %report.stage,
            duration_ms = report.duration_ms,
            error = report.error.as_deref().unwrap_or("unknown error"),
            "Stage {} failed", report.stage
        ),
        StageStatus::Skipped => info!(
            event = "stage.skipped",
            run_id = %run_id,
            stage = %report.stage,
            "Stage {} skipped", report.stage
        ),
        StageStatus::Succeeded => info!(
            event = "stage.finished",
            run_id = %run_id,
            stage = %report.stage,
            rows = report.rows,
            duration_ms = report.duration_ms,
            "Stage {} finished", report.stage
        ),
    }
}

pub fn emit_gate_evaluated(run_id: &str, verdict: &ValidationVerdict) {
    if verdict.success {
        info!(
            event = "gate.evaluated",
            run_id = %run_id,
            evaluated = verdict.evaluated,
            passed = true,
            "{}", verdict.summary()
        );
    } else {
        for failure in &verdict.failures {
            warn!(
                event = "gate.violation",
                run_id = %run_id,
                predicate = %failure.predicate_name,
                "{}", failure.message
            );
        }
        warn!(
            event = "gate.evaluated",
            run_id = %run_id,
            evaluated = verdict.evaluated,
            failures = verdict.failures.len(),
            passed = false,
            "{}", verdict.summary()
        );
    }
}

pub fn emit_run_finished(run_id: &str, report: &RunReport) {
    if report.is_success() {
        info!(
            event = "run.finished",
            run_id = %run_id,
            duration_ms = report.duration_ms,
            success = true,
            "Pipeline run completed"
        );
    } else {
        warn!(
            event = "run.finished",
            run_id = %run_id,
            duration_ms = report.duration_ms,
            success = false,
            outcome = %report.outcome,
            "Pipeline run aborted"
        );
    }
}

/// Receives run lifecycle notifications from the orchestrator.
///
/// Every method has a no-op default so observers only implement what they
/// care about.
pub trait RunObserver: Send + Sync {
    fn run_started(&self, _run_id: &str, _source: &str, _config_digest: &str) {}

    fn state_changed(&self, _run_id: &str, _from: RunState, _to: RunState) {}

    fn stage_finished(&self, _run_id: &str, _report: &StageReport) {}

    fn gate_evaluated(&self, _run_id: &str, _verdict: &ValidationVerdict) {}

    fn run_finished(&self, _run_id: &str, _report: &RunReport) {}
}

/// Forwards every notification to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn run_started(&self, run_id: &str, source: &str, config_digest: &str) {
        emit_run_started(run_id, source, config_digest);
    }

    fn state_changed(&self, run_id: &str, from: RunState, to: RunState) {
        emit_state_changed(run_id, from, to);
    }

    fn stage_finished(&self, run_id: &str, report: &StageReport) {
        emit_stage_finished(run_id, report);
    }

    fn gate_evaluated(&self, run_id: &str, verdict: &ValidationVerdict) {
        emit_gate_evaluated(run_id, verdict);
    }

    fn run_finished(&self, run_id: &str, report: &RunReport) {
        emit_run_finished(run_id, report);
    }
}

/// A notification captured by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    RunStarted { run_id: String },
    StateChanged { from: RunState, to: RunState },
    StageFinished(StageReport),
    GateEvaluated(ValidationVerdict),
    RunFinished { success: bool },
}

/// Keeps every notification in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.lock().clone()
    }

    /// Target states of every recorded transition.
    pub fn states(&self) -> Vec<RunState> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ObservedEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, event: ObservedEvent) {
        self.lock().push(event);
    }
}

impl RunObserver for RecordingObserver {
    fn run_started(&self, run_id: &str, _source: &str, _config_digest: &str) {
        self.push(ObservedEvent::RunStarted {
            run_id: run_id.to_string(),
        });
    }

    fn state_changed(&self, _run_id: &str, from: RunState, to: RunState) {
        self.push(ObservedEvent::StateChanged { from, to });
    }

    fn stage_finished(&self, _run_id: &str, report: &StageReport) {
        self.push(ObservedEvent::StageFinished(report.clone()));
    }

    fn gate_evaluated(&self, _run_id: &str, verdict: &ValidationVerdict) {
        self.push(ObservedEvent::GateEvaluated(verdict.clone()));
    }

    fn run_finished(&self, _run_id: &str, report: &RunReport) {
        self.push(ObservedEvent::RunFinished {
            success: report.is_success(),
        });
    }
}
