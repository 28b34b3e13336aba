//! Pipeline orchestration: one run = extract, transform, validate, aggregate,
//! and optionally publish.
//!
//! A run moves through [`RunState`]s strictly in order. Any stage failure,
//! a failing validation verdict or cancellation moves it to
//! [`RunState::Aborted`] and stops it; layers persisted before that point are
//! left as they are, and layers after it are never written.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::config::{GateInput, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::fetch::{FetchError, SourceFetcher};
use crate::lock::RunLock;
use crate::obs::{self, RunObserver, TracingObserver};
use crate::stage::{Stage, StageReport, StageStatus};
use crate::store::{Layer, LayerStore, LayerWrite};
use crate::table::Table;
use crate::transform::transform;
use crate::validate::{ValidationGate, ValidationVerdict};
use medallion_sink::TableSink;

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    Validating,
    Aggregating,
    Aborted,
    Completed,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Extracting => "extracting",
            RunState::Transforming => "transforming",
            RunState::Validating => "validating",
            RunState::Aggregating => "aggregating",
            RunState::Aborted => "aborted",
            RunState::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Aborted | RunState::Completed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Extracting)
            | (Extracting, Transforming)
            | (Transforming, Validating)
            | (Transforming, Aggregating)
            | (Validating, Aggregating)
            | (Aggregating, Completed) => true,
            (state, Aborted) => !state.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// The gate rejected the data; see the report's verdict.
    ValidationFailed,
    StageFailed { stage: Stage, error: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted { reason: AbortReason },
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Aborted { reason } => match reason {
                AbortReason::ValidationFailed => f.write_str("aborted: validation failed"),
                AbortReason::StageFailed { stage, error } => {
                    write!(f, "aborted: {stage} failed: {error}")
                }
                AbortReason::Cancelled => f.write_str("aborted: cancelled"),
            },
        }
    }
}

/// Everything a caller needs to know about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub final_state: RunState,
    pub stages: Vec<StageReport>,
    /// Present when the gate ran.
    pub verdict: Option<ValidationVerdict>,
    pub layers: Vec<LayerWrite>,
    /// Rows written to the sink, when one is attached.
    pub published_rows: Option<u64>,
    pub duration_ms: u64,
    pub config_digest: String,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn layer(&self, layer: Layer) -> Option<&LayerWrite> {
        self.layers.iter().find(|w| w.layer == layer)
    }

    pub fn failed_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
            .count()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Process-local state of one run. Dropped once the report is built.
struct PipelineRun {
    run_id: String,
    state: RunState,
    started: Instant,
    stages: Vec<StageReport>,
    layers: Vec<LayerWrite>,
    verdict: Option<ValidationVerdict>,
    published_rows: Option<u64>,
    observer: Arc<dyn RunObserver>,
}

impl PipelineRun {
    fn new(run_id: String, observer: Arc<dyn RunObserver>) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            started: Instant::now(),
            stages: Vec::new(),
            layers: Vec::new(),
            verdict: None,
            published_rows: None,
            observer,
        }
    }

    fn transition(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Unexpected run state transition");
        }
        self.observer.state_changed(&self.run_id, self.state, next);
        self.state = next;
    }

    fn record(&mut self, report: StageReport) {
        self.observer.stage_finished(&self.run_id, &report);
        self.stages.push(report);
    }

    /// Record `stage` as failed and produce the abort reason.
    fn fail(&mut self, stage: Stage, started: Instant, error: impl std::fmt::Display) -> AbortReason {
        let error = error.to_string();
        self.record(StageReport::failed(stage, elapsed_ms(started), error.clone()));
        AbortReason::StageFailed { stage, error }
    }

    fn finish(mut self, result: std::result::Result<(), AbortReason>, config_digest: String) -> RunReport {
        let outcome = match result {
            Ok(()) => RunOutcome::Completed,
            Err(reason) => {
                if !self.state.is_terminal() {
                    self.transition(RunState::Aborted);
                }
                RunOutcome::Aborted { reason }
            }
        };
        RunReport {
            run_id: self.run_id,
            outcome,
            final_state: self.state,
            stages: self.stages,
            verdict: self.verdict,
            layers: self.layers,
            published_rows: self.published_rows,
            duration_ms: elapsed_ms(self.started),
            config_digest,
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> std::result::Result<(), AbortReason> {
    if cancel.is_cancelled() {
        Err(AbortReason::Cancelled)
    } else {
        Ok(())
    }
}

/// Staged bronze/silver/gold pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    store: LayerStore,
    fetcher: SourceFetcher,
    gate: ValidationGate,
    observer: Arc<dyn RunObserver>,
    sink: Option<Arc<dyn TableSink>>,
}

impl Pipeline {
    /// Build a pipeline for `config`. Creates the storage root.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = LayerStore::new(&config.storage_root)?
            .with_dataset(config.dataset.clone())
            .with_history(config.keep_history);
        let fetcher = SourceFetcher::new(config.retry, config.fetch_timeout())?;
        let gate = ValidationGate::new(config.gate.clone());
        Ok(Self {
            config,
            store,
            fetcher,
            gate,
            observer: Arc::new(TracingObserver),
            sink: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Publish gold to `sink` at the end of every completed run.
    pub fn with_sink(mut self, sink: Arc<dyn TableSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    /// Execute one run to completion.
    pub async fn run(&self) -> Result<RunReport> {
        self.run_with_cancel(&CancellationToken::new()).await
    }

    /// Execute one run, aborting at the next stage boundary (or mid-fetch)
    /// once `cancel` fires.
    ///
    /// Stage failures are reported inside the returned [`RunReport`]; `Err`
    /// means the run could not start.
    pub async fn run_with_cancel(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.run_inner(run_id, cancel).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, cancel: &CancellationToken) -> Result<RunReport> {
        let _lock = RunLock::acquire(self.store.root(), &run_id)?;
        let config_digest = self.config.config_digest();

        self.observer
            .run_started(&run_id, &self.config.source.to_string(), &config_digest);
        let mut run = PipelineRun::new(run_id, self.observer.clone());

        let result = self.execute(&mut run, cancel).await;
        let report = run.finish(result, config_digest);
        self.observer.run_finished(&report.run_id, &report);
        Ok(report)
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), AbortReason> {
        checkpoint(cancel)?;
        run.transition(RunState::Extracting);
        let started = Instant::now();
        let bronze = match self.fetcher.fetch(&self.config.source, cancel).await {
            Ok(table) => Arc::new(table),
            Err(FetchError::Cancelled) => return Err(AbortReason::Cancelled),
            Err(e) => return Err(run.fail(Stage::Extract, started, e)),
        };
        self.persist(run, Stage::Extract, Layer::Bronze, bronze.clone(), started)
            .await?;

        checkpoint(cancel)?;
        run.transition(RunState::Transforming);
        let started = Instant::now();
        let silver = match transform(&bronze, self.config.transform_mode) {
            Ok(table) => Arc::new(table),
            Err(e) => return Err(run.fail(Stage::Transform, started, e)),
        };
        self.persist(run, Stage::Transform, Layer::Silver, silver.clone(), started)
            .await?;

        checkpoint(cancel)?;
        if self.config.with_validation {
            run.transition(RunState::Validating);
            let started = Instant::now();
            let input = match (self.config.re_validate, self.config.gate_input) {
                (true, gate_input) => match self.store.read_async(gate_input.layer()).await {
                    Ok(table) => Arc::new(table),
                    Err(e) => return Err(run.fail(Stage::Validate, started, e)),
                },
                (false, GateInput::Silver) => silver.clone(),
                (false, GateInput::Bronze) => bronze.clone(),
            };

            let verdict = self.gate.validate(&input);
            self.observer.gate_evaluated(&run.run_id, &verdict);
            run.verdict = Some(verdict.clone());
            if !verdict.success {
                run.record(StageReport::failed(
                    Stage::Validate,
                    elapsed_ms(started),
                    verdict.summary(),
                ));
                return Err(AbortReason::ValidationFailed);
            }
            run.record(StageReport::succeeded(
                Stage::Validate,
                input.num_rows(),
                elapsed_ms(started),
            ));
            checkpoint(cancel)?;
        } else {
            info!(run_id = %run.run_id, "Validation disabled, skipping gate");
            run.record(StageReport::skipped(Stage::Validate));
        }

        run.transition(RunState::Aggregating);
        let started = Instant::now();
        let gold = match aggregate(&silver, self.config.top_n) {
            Ok(table) => Arc::new(table),
            Err(e) => return Err(run.fail(Stage::Aggregate, started, e)),
        };
        self.persist(run, Stage::Aggregate, Layer::Gold, gold.clone(), started)
            .await?;

        match &self.sink {
            Some(sink) => {
                checkpoint(cancel)?;
                let started = Instant::now();
                match sink
                    .replace_table(&self.config.sink_table, &gold.to_sink_table())
                    .await
                {
                    Ok(rows) => {
                        run.published_rows = Some(rows);
                        run.record(StageReport::succeeded(
                            Stage::Publish,
                            rows as usize,
                            elapsed_ms(started),
                        ));
                    }
                    Err(e) => return Err(run.fail(Stage::Publish, started, e)),
                }
            }
            None => run.record(StageReport::skipped(Stage::Publish)),
        }

        run.transition(RunState::Completed);
        Ok(())
    }

    async fn persist(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        layer: Layer,
        table: Arc<Table>,
        started: Instant,
    ) -> std::result::Result<(), AbortReason> {
        let rows = table.num_rows();
        match self.store.write_async(layer, table).await {
            Ok(receipt) => {
                run.layers.push(receipt);
                run.record(StageReport::succeeded(stage, rows, elapsed_ms(started)));
                Ok(())
            }
            Err(e) => Err(run.fail(stage, started, e)),
        }
    }

    /// Run the configured gate against a persisted layer.
    pub async fn validate_layer(&self, layer: Layer) -> Result<ValidationVerdict> {
        let table = self.store.read_async(layer).await?;
        let verdict = self.gate.validate(&table);
        obs::emit_gate_evaluated("adhoc", &verdict);
        Ok(verdict)
    }

    /// Publish the current gold snapshot to the attached sink.
    pub async fn publish_gold(&self) -> Result<u64> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| PipelineError::Config("no sink attached".to_string()))?;
        let gold = self.store.read_async(Layer::Gold).await?;
        let rows = sink
            .replace_table(&self.config.sink_table, &gold.to_sink_table())
            .await?;
        info!(table = %self.config.sink_table, rows, "Gold published");
        Ok(rows)
    }
}
