use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use swarmcov_app::{FormationFile, Supervisor, SupervisorConfig, WorkerMessage};
use swarmcov_core::{BatchId, CoverageConfig};
use swarmcov_storage::{CommandStore, StorePipeline};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "swarmcov",
    version,
    about = "Run connectivity-preserving arc coverage formations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Step one or more batches to completion and print per-batch outcomes.
    Run(RunArgs),
    /// Print commands or batch summaries from a recorded database.
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON formation file; a seeded demo formation is used when absent.
    #[arg(long, env = "SWARMCOV_FORMATION")]
    formation: Option<PathBuf>,

    /// Number of independent batches, each on its own worker thread.
    #[arg(long, default_value_t = 1)]
    batches: u32,

    /// Agents per batch in the demo formation.
    #[arg(long, default_value_t = 6)]
    agents: usize,

    #[arg(long, env = "SWARMCOV_SEED", default_value_t = 0x5EED_0001)]
    seed: u64,

    /// Override the configured run length in seconds.
    #[arg(long)]
    total_time: Option<f64>,

    /// Override the configured per-epoch timeout.
    #[arg(long, env = "SWARMCOV_EPOCH_TIMEOUT_MS")]
    epoch_timeout_ms: Option<u64>,

    /// Record every command and epoch summary into this DuckDB file.
    #[arg(long, env = "SWARMCOV_RECORD")]
    record: Option<PathBuf>,

    /// Coverage ratio counted as covered when reporting time above threshold.
    #[arg(long, default_value_t = 0.85)]
    coverage_threshold: f64,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// DuckDB file written by `run --record`.
    path: PathBuf,

    /// Only this batch.
    #[arg(long)]
    batch: Option<u32>,

    /// Stop after this many commands.
    #[arg(long)]
    limit: Option<usize>,

    /// Print per-batch summaries instead of commands.
    #[arg(long)]
    summary: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Replay(args) => replay(args),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();
}

fn batch_file(args: &RunArgs, batch: u32) -> Result<FormationFile> {
    let mut file = match &args.formation {
        Some(path) => FormationFile::load(path)?,
        None => FormationFile::demo(
            args.agents,
            args.seed.wrapping_add(u64::from(batch)),
            CoverageConfig::default(),
        ),
    };
    if let Some(total_time) = args.total_time {
        file.config.total_time = total_time;
    }
    file.for_batch(batch)
}

fn run(args: RunArgs) -> Result<()> {
    if args.batches == 0 {
        bail!("--batches must be at least 1");
    }
    let files = (0..args.batches)
        .map(|batch| batch_file(&args, batch))
        .collect::<Result<Vec<_>>>()?;
    let mut supervision = SupervisorConfig::from_config(&files[0].config);
    if let Some(ms) = args.epoch_timeout_ms {
        supervision.epoch_timeout = Duration::from_millis(ms);
    }
    let pipeline = args
        .record
        .as_ref()
        .map(StorePipeline::new)
        .transpose()
        .context("failed to open record database")?;

    let mut supervisor = Supervisor::new(supervision);
    for (batch, file) in (0..args.batches).zip(files) {
        supervisor.launch(BatchId(batch), file.build()?)?;
    }
    info!(
        batches = args.batches,
        timeout_ms = supervision.epoch_timeout.as_millis() as u64,
        record = ?args.record,
        "formations launched"
    );

    let outcomes = supervisor.run(|message| {
        let Some(pipeline) = pipeline.as_ref() else {
            return;
        };
        match message {
            WorkerMessage::Command { batch, command } => pipeline.record_command(batch, command),
            WorkerMessage::Epoch { batch, report } => pipeline.record_epoch(batch, report),
            WorkerMessage::Exit { .. } => pipeline.flush(),
        }
    });
    drop(pipeline);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut failed = 0;
    for outcome in &outcomes {
        let above = outcome.time_above(args.coverage_threshold);
        if !outcome.is_completed() {
            failed += 1;
            warn!(batch = %outcome.batch, status = ?outcome.status, "batch did not complete");
        }
        let line = json!({
            "batch": outcome.batch,
            "status": outcome.status,
            "commands": outcome.commands,
            "epochs": outcome.coverage.len(),
            "time_above_threshold": above,
        });
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    if failed > 0 {
        bail!("{failed} of {} batches did not complete", outcomes.len());
    }
    Ok(())
}

fn replay(args: ReplayArgs) -> Result<()> {
    let mut store = CommandStore::open(&args.path)
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if args.summary {
        for summary in store.batch_summaries()? {
            if args.batch.is_some_and(|batch| batch != summary.batch.0) {
                continue;
            }
            let line = json!({
                "batch": summary.batch,
                "epochs": summary.epochs,
                "commands": summary.commands,
                "last_epoch": summary.last_epoch,
                "min_fiedler": summary.min_fiedler,
                "mean_coverage": summary.mean_coverage,
            });
            writeln!(out, "{line}")?;
        }
    } else {
        let commands = store.load_commands(args.batch.map(BatchId))?;
        let limit = args.limit.unwrap_or(usize::MAX);
        for recorded in commands.iter().take(limit) {
            let line = json!({
                "batch": recorded.batch,
                "command": recorded.command,
            });
            writeln!(out, "{line}")?;
        }
    }
    out.flush()?;
    Ok(())
}
