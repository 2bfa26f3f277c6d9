use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cycle_harness::{simulate, HarnessConfig, HarnessError, IrModel, RunReport};

/// Cycle-driven simulation harness - runs a behaviour-IR model tick by tick
/// and records a VCD waveform
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Behaviour-IR JSON file describing the model
    model: PathBuf,

    /// Run configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of ticks
    #[arg(short, long)]
    budget: Option<u64>,

    /// Output VCD file
    #[arg(short, long)]
    trace: Option<PathBuf>,

    /// VCD timescale (e.g. 1ns, 10ps)
    #[arg(long)]
    timescale: Option<String>,

    /// Signal to trace, by exact name or substring (repeatable; default all)
    #[arg(short, long = "signal", value_name = "NAME")]
    signals: Vec<String>,

    /// Model signal that ends the run when non-zero
    #[arg(long)]
    finish_signal: Option<String>,

    /// Model input to toggle every tick
    #[arg(long)]
    clock: Option<String>,

    /// Model reset input
    #[arg(long)]
    reset: Option<String>,

    /// Ticks to hold reset asserted
    #[arg(long)]
    reset_ticks: Option<u64>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Arguments forwarded to the model (`+name=value`)
    #[arg(last = true)]
    plusargs: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(report) => {
            info!(
                ticks = report.ticks,
                records = report.records,
                value_changes = report.trace_stats.value_changes,
                reason = ?report.reason,
                "run complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let code = err
                .downcast_ref::<HarnessError>()
                .map_or(1, HarnessError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: &Cli) -> Result<RunReport> {
    let config = load_config(cli)?;
    let options = config.model_options();
    info!(
        model = %cli.model.display(),
        trace = %config.trace_path.display(),
        budget = config.budget,
        "starting simulation"
    );

    simulate(&config, || {
        let mut model = IrModel::load(&cli.model, &options)?;
        model.apply_plusargs(&cli.plusargs)?;
        Ok(model)
    })
    .with_context(|| format!("simulating {}", cli.model.display()))
}

fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    if let Some(budget) = cli.budget {
        config.budget = budget;
    }
    if let Some(trace) = &cli.trace {
        config.trace_path = trace.clone();
    }
    if let Some(timescale) = &cli.timescale {
        config.timescale = timescale.clone();
    }
    if !cli.signals.is_empty() {
        config.trace_signals = cli.signals.clone();
    }
    if let Some(finish) = &cli.finish_signal {
        config.finish_signal = Some(finish.clone());
    }
    if let Some(clock) = &cli.clock {
        config.clock_signal = Some(clock.clone());
    }
    if let Some(reset) = &cli.reset {
        config.reset_signal = Some(reset.clone());
    }
    if let Some(ticks) = cli.reset_ticks {
        config.reset_ticks = ticks;
    }

    config.validate().context("invalid command-line options")?;
    Ok(config)
}
