//! Medallion - staged bronze/silver/gold ETL pipeline CLI
//!
//! ## Commands
//!
//! - `run`: fetch, transform, validate and aggregate into the layer store
//! - `show`: print the gold summary (totals and rankings)
//! - `publish`: replace the sink table with the current gold layer
//! - `validate`: run the validation gate against a stored layer

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};

use medallion_core::aggregate::MAX_CONFIRMED;
use medallion_core::summary::DEFAULT_RANKING_LIMIT;
use medallion_core::telemetry::RUN_LOG_FILE_NAME;
use medallion_core::{
    GateConfig, GateInput, GoldSummary, Layer, LayerStore, Pipeline, PipelineConfig, Predicate,
    RunReport, SourceLocator, StageStatus, SummaryView, TransformMode, ValidationVerdict,
};
use medallion_sink::{SurrealTableSink, TableSink};

#[derive(Parser)]
#[command(name = "medallion")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged bronze/silver/gold ETL pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Storage root holding the layers, lock and run log
    #[arg(long, global = true, env = "MEDALLION_ROOT", default_value = "data")]
    root: PathBuf,

    /// Log file path (`run` defaults to <root>/pipeline_log.log)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Do not write a run log file
    #[arg(long, global = true, conflicts_with = "log_file")]
    no_log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once
    Run(RunArgs),

    /// Show the gold layer summary
    Show {
        /// Entities listed per ranking
        #[arg(short, long, default_value_t = DEFAULT_RANKING_LIMIT)]
        limit: usize,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Replace the sink table with the current gold layer
    Publish {
        #[command(flatten)]
        sink: SinkArgs,
    },

    /// Validate a stored layer without running the pipeline
    Validate {
        /// Layer to check
        #[arg(long, default_value = "silver")]
        layer: Layer,

        /// Also require confirmed >= recovered + deaths
        #[arg(long)]
        strict_outcomes: bool,
    },
}

#[derive(Args, Debug, Default)]
struct SinkArgs {
    /// Sink connection URL (mem://, surrealkv://<path>, ws://...);
    /// default: MEDALLION_SINK_URL or <root>/sink
    #[arg(long)]
    sink_url: Option<String>,

    /// Sink table receiving gold
    #[arg(long)]
    sink_table: Option<String>,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Source CSV URL or path
    #[arg(long)]
    source: Option<String>,

    /// Silver derivation: basic, enriched or active
    #[arg(long)]
    transform: Option<TransformMode>,

    /// Skip the validation gate
    #[arg(long)]
    no_validation: bool,

    /// Validate the persisted snapshot instead of the in-memory table
    #[arg(long)]
    re_validate: bool,

    /// Layer the gate evaluates: bronze or silver
    #[arg(long)]
    gate_input: Option<GateInput>,

    /// Also require confirmed >= recovered + deaths
    #[arg(long)]
    strict_outcomes: bool,

    /// Entities kept in gold
    #[arg(long)]
    top_n: Option<usize>,

    /// Per-attempt fetch timeout
    #[arg(long)]
    fetch_timeout_secs: Option<u64>,

    /// Keep a timestamped copy of every layer write
    #[arg(long)]
    keep_history: bool,

    /// Publish gold to the sink after a completed run
    #[arg(long)]
    publish: bool,

    #[command(flatten)]
    sink: SinkArgs,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = log_path(&cli);
    medallion_core::init_tracing(cli.json, level, log_file.as_deref())
        .context("Failed to open run log")?;

    match cli.command {
        Commands::Run(args) => cmd_run(&cli.root, &args).await,
        Commands::Show { limit, output } => cmd_show(&cli.root, limit, output),
        Commands::Publish { sink } => cmd_publish(&cli.root, &sink).await,
        Commands::Validate {
            layer,
            strict_outcomes,
        } => cmd_validate(&cli.root, layer, strict_outcomes).await,
    }
}

/// Only `run` logs to `<root>` by default; the read-only commands leave it untouched.
fn log_path(cli: &Cli) -> Option<PathBuf> {
    if cli.no_log_file {
        return None;
    }
    match (&cli.log_file, &cli.command) {
        (Some(path), _) => Some(path.clone()),
        (None, Commands::Run(_)) => Some(cli.root.join(RUN_LOG_FILE_NAME)),
        (None, _) => None,
    }
}

/// Environment defaults overridden by explicit flags.
fn build_config(root: &Path, args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()
        .context("Invalid MEDALLION_* environment")?
        .with_storage_root(root)
        .with_validation(!args.no_validation)
        .with_re_validate(args.re_validate)
        .with_keep_history(args.keep_history);

    if let Some(source) = &args.source {
        config = config.with_source(SourceLocator::parse(source));
    }
    if let Some(mode) = args.transform {
        config = config.with_transform_mode(mode);
    }
    if let Some(input) = args.gate_input {
        config = config.with_gate_input(input);
    }
    if args.strict_outcomes {
        config = config.with_gate(GateConfig::strict());
    }
    if let Some(top_n) = args.top_n {
        config = config.with_top_n(top_n);
    }
    if let Some(secs) = args.fetch_timeout_secs {
        config.fetch_timeout_secs = secs;
    }
    if let Some(table) = &args.sink.sink_table {
        config = config.with_sink_table(table.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn open_sink(root: &Path, url: Option<&str>) -> Result<Arc<dyn TableSink>> {
    let sink = match url {
        Some(url) => SurrealTableSink::connect(url).await,
        None => SurrealTableSink::from_env(root.join("sink")).await,
    }
    .context("Failed to connect to sink")?;
    Ok(Arc::new(sink))
}

async fn cmd_run(root: &Path, args: &RunArgs) -> Result<()> {
    let config = build_config(root, args)?;
    let mut pipeline = Pipeline::new(config).context("Failed to set up pipeline")?;
    if args.publish {
        pipeline = pipeline.with_sink(open_sink(root, args.sink.sink_url.as_deref()).await?);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let report = pipeline
        .run_with_cancel(&cancel)
        .await
        .context("Pipeline run could not start")?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_report(&report)),
    }

    if report.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Pipeline run {}: {}", report.run_id, report.outcome)
    }
}

fn cmd_show(root: &Path, limit: usize, output: OutputFormat) -> Result<()> {
    let store = LayerStore::open(root);
    let view = GoldSummary::load(&store, limit).context("Failed to load gold layer")?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => print!("{}", render_summary(&view)),
    }
    Ok(())
}

async fn cmd_publish(root: &Path, sink_args: &SinkArgs) -> Result<()> {
    let mut config = PipelineConfig::from_env()?.with_storage_root(root);
    if let Some(table) = &sink_args.sink_table {
        config = config.with_sink_table(table.clone());
    }
    let sink = open_sink(root, sink_args.sink_url.as_deref()).await?;
    let pipeline = Pipeline::new(config)?.with_sink(sink.clone());

    let written = pipeline
        .publish_gold()
        .await
        .context("Failed to publish gold layer")?;
    let table = &pipeline.config().sink_table;
    let stored = sink.count_rows(table).await?;

    println!("Published {written} row(s) to '{table}' ({stored} row(s) now stored)");
    if stored != written {
        anyhow::bail!("Sink holds {stored} row(s), expected {written}");
    }
    Ok(())
}

async fn cmd_validate(root: &Path, layer: Layer, strict_outcomes: bool) -> Result<()> {
    let mut config = PipelineConfig::from_env()?.with_storage_root(root);
    if strict_outcomes {
        config = config.with_gate(GateConfig::strict());
    }
    if layer == Layer::Gold {
        // Gold has no raw entity/confirmed pair; check its own columns.
        config = config.with_gate(GateConfig {
            predicates: vec![
                Predicate::EntityNotNull,
                Predicate::ColumnNonNegative {
                    column: MAX_CONFIRMED.to_string(),
                },
            ],
        });
    }
    let pipeline = Pipeline::new(config)?;
    let verdict = pipeline
        .validate_layer(layer)
        .await
        .with_context(|| format!("Failed to validate {layer} layer"))?;

    print!("{}", render_verdict(layer, &verdict));
    if verdict.success {
        Ok(())
    } else {
        anyhow::bail!("{layer} layer failed validation")
    }
}

fn render_verdict(layer: Layer, verdict: &ValidationVerdict) -> String {
    let mut out = String::new();
    let status = if verdict.success { "✓ PASSED" } else { "✗ FAILED" };
    let _ = writeln!(out, "Gate ({layer}): {status}");
    let _ = writeln!(out, "{}", verdict.summary());
    for failure in &verdict.failures {
        let _ = writeln!(out, "  - {}: {}", failure.predicate_name, failure.message);
    }
    out
}

fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let status = if report.is_success() {
        "✓ COMPLETED".to_string()
    } else {
        format!("✗ {}", report.outcome)
    };
    let _ = writeln!(out, "Run ID: {}", report.run_id);
    let _ = writeln!(out, "Status: {status}");
    let _ = writeln!(out, "Duration: {}ms", report.duration_ms);
    let _ = writeln!(out);

    for stage in &report.stages {
        let mark = match stage.status {
            StageStatus::Succeeded => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "-",
        };
        let _ = write!(out, "  {mark} {} ({}ms, {} rows)", stage.stage, stage.duration_ms, stage.rows);
        if let Some(error) = &stage.error {
            let _ = write!(out, ": {error}");
        }
        let _ = writeln!(out);
    }

    if let Some(verdict) = &report.verdict {
        let _ = writeln!(out);
        let _ = writeln!(out, "Gate: {}", verdict.summary());
        for failure in &verdict.failures {
            let _ = writeln!(out, "  - {}: {}", failure.predicate_name, failure.message);
        }
    }

    if !report.layers.is_empty() {
        let _ = writeln!(out);
        for write in &report.layers {
            let _ = writeln!(
                out,
                "  {} -> {} ({} rows, {})",
                write.layer,
                write.path.display(),
                write.rows,
                &write.digest[..12.min(write.digest.len())]
            );
        }
    }
    if let Some(rows) = report.published_rows {
        let _ = writeln!(out, "  published {rows} row(s) to sink");
    }
    out
}

fn render_summary(view: &SummaryView) -> String {
    let summary = match view {
        SummaryView::Missing { path } => {
            return format!(
                "No gold layer found at {}. Run the pipeline first: medallion run\n",
                path.display()
            );
        }
        SummaryView::Ready(summary) => summary,
    };

    let mut out = String::new();
    let _ = writeln!(out, "Gold summary ({} entities)", summary.entities);
    let _ = writeln!(out, "  Total confirmed:  {}", summary.total_confirmed);
    let _ = writeln!(out, "  Total deaths:     {}", summary.total_deaths);
    let _ = writeln!(out, "  Total recovered:  {}", summary.total_recovered);
    let _ = writeln!(out, "  Mortality:        {:.2}%", summary.mortality_pct);

    let _ = writeln!(out);
    let _ = writeln!(out, "Top {} by confirmed:", summary.top_by_confirmed.len());
    let _ = writeln!(
        out,
        "  {:>3}  {:<24} {:>12} {:>10} {:>12}",
        "#", "Entity", "Confirmed", "Deaths", "Recovered"
    );
    for (i, r) in summary.top_by_confirmed.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {:>3}  {:<24} {:>12} {:>10} {:>12}",
            i + 1,
            r.entity,
            r.max_confirmed,
            r.max_deaths,
            r.max_recovered
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Top {} by mortality rate:", summary.top_by_mortality.len());
    let _ = writeln!(
        out,
        "  {:>3}  {:<24} {:>12} {:>10} {:>10}",
        "#", "Entity", "Confirmed", "Deaths", "Mortality"
    );
    for (i, r) in summary.top_by_mortality.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {:>3}  {:<24} {:>12} {:>10} {:>9.2}%",
            i + 1,
            r.entity,
            r.max_confirmed,
            r.max_deaths,
            r.mortality_pct
        );
    }
    out
}
