//! fnbench - debugging-agent overhead benchmark for serverless functions.
//!
//! Deploys the instrumented and plain variants side by side, measures both
//! under the same protocol and writes a statistical comparison.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use fnbench::benchmarks::{
    BenchmarkOrchestrator, ComparisonReport, ResultStore, RunContext, VariantRun,
};
use fnbench::remote::{
    AgentActionClient, CloudMonitoringSignal, HttpAgentActionClient, MonitoringSignal,
    ProcessExecutor, RemoteCommandExecutor,
};
use fnbench_common::{
    BenchConfig, ConfigError, ConfigSource, LogConfig, LoadedConfig, Variant, VariantSelection,
    init_logging,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "fnbench")]
#[command(author, version, about = "Measure debugging-agent overhead on serverless functions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy, measure and clean up both variants, then compare them
    Run(RunArgs),

    /// Rebuild the comparison report from saved run results
    Compare {
        /// Aggregate results of the instrumented variant
        #[arg(long)]
        instrumented: PathBuf,

        /// Aggregate results of the plain variant
        #[arg(long)]
        plain: PathBuf,

        /// Directory for the report files
        #[arg(short, long, default_value = "fnbench-results")]
        output: PathBuf,
    },

    /// Load and validate configuration, printing each value with its source
    CheckConfig {
        /// Path to a TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Functions to deploy per variant
    #[arg(short = 'n', long)]
    functions: Option<usize>,

    /// Concurrent cases per variant
    #[arg(short, long)]
    workers: Option<usize>,

    /// Which variants to run (both, instrumented, plain)
    #[arg(long)]
    variant: Option<VariantSelection>,

    /// Skip cold confirmation and warm functions up instead
    #[arg(long)]
    no_cold: bool,

    /// Directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    /// Apply flags on top of the loaded layers and record them as command-line sources.
    fn apply(&self, loaded: &mut LoadedConfig) {
        let run = &mut loaded.config.run;
        let sources = &mut loaded.sources;
        if let Some(n) = self.functions {
            run.functions_per_variant = n;
            sources.record("run.functions_per_variant", ConfigSource::CommandLine);
        }
        if let Some(w) = self.workers {
            run.workers = Some(w);
            sources.record("run.workers", ConfigSource::CommandLine);
        }
        if let Some(selection) = self.variant {
            run.variants = selection;
            sources.record("run.variants", ConfigSource::CommandLine);
        }
        if self.no_cold {
            run.require_cold = false;
            sources.record("run.require_cold", ConfigSource::CommandLine);
        }
        if let Some(dir) = &self.output {
            run.output_dir = dir.clone();
            sources.record("run.output_dir", ConfigSource::CommandLine);
        }
    }
}

/// How a successful command ended.
enum Finish {
    Done,
    Interrupted,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env().with_verbosity(cli.verbose);
    let _logging_guards = match init_logging(&log_config) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("fnbench: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Compare {
            instrumented,
            plain,
            output,
        } => compare(&instrumented, &plain, &output),
        Commands::CheckConfig { config } => check_config(config.as_deref()),
    };

    match result {
        Ok(Finish::Done) => ExitCode::SUCCESS,
        Ok(Finish::Interrupted) => {
            warn!("Run interrupted; partial results were saved");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            error!("{e:#}");
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::from(EXIT_FAILURE)
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    Ok(BenchConfig::load(path)?)
}

async fn run(args: RunArgs) -> Result<Finish> {
    let mut loaded = load_config(args.config.as_deref())?;
    args.apply(&mut loaded);
    loaded.config.validate()?;
    let config = Arc::new(loaded.config);

    let ctx = RunContext::new();
    {
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing in-flight steps and cleaning up");
                cancel.cancel();
            }
        });
    }

    let executor: Arc<dyn RemoteCommandExecutor> = Arc::new(ProcessExecutor::new());
    let signal: Arc<dyn MonitoringSignal> = Arc::new(CloudMonitoringSignal::new(
        executor.clone(),
        config.deployment.project.clone(),
        config.deployment.command_timeout,
        config.cold.staleness,
    ));

    info!(
        project = %config.deployment.project,
        functions = config.run.functions_per_variant,
        workers = config.run.effective_workers(),
        regions = %config.run.regions.join(","),
        "Starting benchmark run"
    );

    let mut handles = Vec::new();
    for variant in config.run.variants.variants() {
        let agent_client: Option<Arc<dyn AgentActionClient>> = variant.has_agent().then(|| {
            Arc::new(HttpAgentActionClient::from_config(executor.clone(), &config.agent))
                as Arc<dyn AgentActionClient>
        });
        let orchestrator = BenchmarkOrchestrator::new(
            variant,
            config.clone(),
            executor.clone(),
            signal.clone(),
            agent_client,
        );
        let ctx = ctx.clone();
        handles.push((
            variant,
            tokio::spawn(async move { orchestrator.run(&ctx).await }),
        ));
    }

    // Every variant task finishes before anything is written.
    let mut runs: Vec<VariantRun> = Vec::new();
    let mut failures = 0usize;
    for (variant, handle) in handles {
        match handle.await {
            Ok(Ok(run)) => runs.push(run),
            Ok(Err(e)) => {
                error!(%variant, error = %e, "Variant run failed");
                failures += 1;
            }
            Err(e) => {
                error!(%variant, error = %e, "Variant run task aborted");
                failures += 1;
            }
        }
    }

    let store = ResultStore::new(&config.run.output_dir);
    let save_errors = store.save_runs(&runs);

    for run in &runs {
        info!(
            variant = %run.variant,
            successful = run.successful(),
            total = run.results.len(),
            deleted = run.cleanup.deleted,
            cleanup_failed = run.cleanup.failed,
            "Variant finished"
        );
    }

    let instrumented = runs.iter().find(|r| r.variant == Variant::Instrumented);
    let plain = runs.iter().find(|r| r.variant == Variant::Plain);
    if let (Some(instrumented), Some(plain)) = (instrumented, plain) {
        let report = ComparisonReport::build(instrumented, plain);
        store.save_report(&report)?;
        println!("{}", report.render_text());
    }

    if let Some(first) = save_errors.into_iter().next() {
        return Err(first).context("saving variant results");
    }
    if ctx.is_cancelled() {
        return Ok(Finish::Interrupted);
    }
    if failures > 0 {
        anyhow::bail!("{failures} variant run(s) failed");
    }
    Ok(Finish::Done)
}

fn compare(instrumented: &Path, plain: &Path, output: &Path) -> Result<Finish> {
    let instrumented = ResultStore::load_run(instrumented)?;
    let plain = ResultStore::load_run(plain)?;
    if instrumented.variant != Variant::Instrumented || plain.variant != Variant::Plain {
        warn!(
            instrumented = %instrumented.variant,
            plain = %plain.variant,
            "Result files do not match the expected variants"
        );
    }

    let report = ComparisonReport::build(&instrumented, &plain);
    let (json, text) = ResultStore::new(output).save_report(&report)?;
    println!("{}", report.render_text());
    info!(json = %json.display(), text = %text.display(), "Report written");
    Ok(Finish::Done)
}

fn check_config(path: Option<&Path>) -> Result<Finish> {
    let loaded = load_config(path)?;
    let width = loaded
        .config
        .describe()
        .iter()
        .map(|(key, _)| key.len())
        .max()
        .unwrap_or(0);
    for (key, value) in loaded.config.describe() {
        println!(
            "{key:<width$}  {value}  [{}]",
            loaded.sources.source_of(key)
        );
    }
    loaded.config.validate()?;
    println!("\nConfiguration is valid.");
    Ok(Finish::Done)
}
