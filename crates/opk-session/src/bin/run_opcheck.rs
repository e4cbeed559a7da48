use std::path::PathBuf;

use clap::Parser;
use opk_runtime::{LogLevel, PrecisionMode, RunMode, SocVersion};
use opk_session::{Session, SessionConfig};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Recomputes golden outputs for captured operator invocations and checks
/// the accelerator's results against them.
#[derive(Debug, Parser)]
#[command(name = "run_opcheck")]
#[command(version)]
#[command(about = "Verify accelerated operator outputs against golden references")]
struct Cli {
    /// JSON session config; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run mode (single or autofuse)
    #[arg(long)]
    mode: Option<String>,

    /// Record manifest (single) or dump directory (autofuse)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// GE graph JSON, required in autofuse mode
    #[arg(long)]
    graph_path: Option<PathBuf>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Operation id prefixes to verify, comma separated
    #[arg(long, value_delimiter = ',')]
    operation_ids: Vec<String>,

    /// Substrings of operator names to verify, comma separated
    #[arg(long, value_delimiter = ',')]
    operation_names: Vec<String>,

    /// Extra precision metrics (rel, cos_sim, kl, ...), comma separated
    #[arg(long, value_delimiter = ',')]
    precision_metrics: Vec<String>,

    /// keep, force_fp16 or force_fp32
    #[arg(long)]
    precision_mode: Option<String>,

    /// Absolute tolerance applied to every float dtype
    #[arg(long)]
    atol: Option<f64>,

    #[arg(short = 'j', long)]
    num_workers: Option<usize>,

    /// Replay cases sequentially
    #[arg(long, default_value_t = false)]
    rerun: bool,

    /// debug, info, warning, error or fatal
    #[arg(long)]
    log_level: Option<String>,

    /// Ascend310P, Ascend910A or Ascend910B
    #[arg(long)]
    soc_version: Option<String>,

    /// Append one JSON line per verified case here
    #[arg(long)]
    case_log: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<SessionConfig, String> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)?,
            None => SessionConfig::default(),
        };
        if let Some(mode) = &self.mode {
            config.mode = mode.parse::<RunMode>().map_err(|err| err.to_string())?;
        }
        if let Some(input) = self.input {
            config.input = input;
        }
        if self.graph_path.is_some() {
            config.graph_path = self.graph_path;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if !self.operation_ids.is_empty() {
            config.operation_ids = self.operation_ids;
        }
        if !self.operation_names.is_empty() {
            config.operation_names = self.operation_names;
        }
        if !self.precision_metrics.is_empty() {
            config.precision_metrics = self.precision_metrics;
        }
        if let Some(mode) = &self.precision_mode {
            config.precision_mode = mode.parse::<PrecisionMode>().map_err(|err| err.to_string())?;
        }
        if let Some(atol) = self.atol {
            config.tolerances = opk_compare::ToleranceConfig::uniform(atol);
        }
        if let Some(workers) = self.num_workers {
            config.num_workers = workers;
        }
        config.rerun |= self.rerun;
        if let Some(level) = &self.log_level {
            config.log_level = level.parse::<LogLevel>().map_err(|err| err.to_string())?;
        }
        if let Some(soc) = &self.soc_version {
            config.soc_version = soc.parse::<SocVersion>().map_err(|err| err.to_string())?;
        }
        if self.case_log.is_some() {
            config.case_log_path = self.case_log;
        }
        Ok(config)
    }
}

const fn tracing_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warning => Level::WARN,
        LogLevel::Error | LogLevel::Fatal => Level::ERROR,
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("run_opcheck failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = Cli::parse().into_config()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing_level(config.log_level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| format!("failed installing log subscriber: {err}"))?;

    info!(mode = config.mode.as_str(), input = %config.input.display(), "starting operator check");
    let session = Session::new(config).map_err(|err| err.to_string())?;
    let output = session.run()?;
    let summary = output.report.summary();
    println!(
        "cases={} passed={} failed={} skipped={} no_actual_output={} unsupported={}",
        summary.total,
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.no_actual_output,
        summary.unsupported
    );
    if let Some(path) = output.report_path {
        println!("report: {}", path.display());
    }
    Ok(())
}
