#![warn(missing_docs)]
//! Trialbench CLI Library
//!
//! Controller side of trialbench: plans trials from the registered tasks,
//! runs each trial in forked worker processes and prints a summary. The
//! same binary doubles as the worker when started with the hidden worker
//! flag.
//!
//! # Example
//!
//! ```ignore
//! use trialbench::prelude::*;
//!
//! inventory::submit!(TaskDef::of::<QueueOffer>());
//!
//! fn main() -> anyhow::Result<()> {
//!     trialbench_cli::run()
//! }
//! ```

mod config;
mod formatting;
mod orchestrator;
mod planner;
mod profilers;
mod supervisor;

pub use config::*;
pub use formatting::{format_summary, format_trial};
pub use orchestrator::{ForkResult, Orchestrator, TrialError, TrialResult};
pub use planner::{ExecutionPlan, PlanError, PlanOptions, build_plan, parse_param};
pub use profilers::*;
pub use supervisor::*;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::collections::BTreeMap;
use trialbench_core::{TaskRegistry, WorkerMain};
use trialbench_stats::Mode;

/// Trialbench CLI arguments
#[derive(Parser, Debug)]
#[command(name = "trialbench")]
#[command(author, version, about = "Trialbench - fork-isolated microbenchmark harness")]
pub struct Cli {
    /// Optional subcommand; defaults to running the plan
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Filter tasks by regex pattern
    #[arg(default_value = ".*")]
    pub filter: String,

    /// Measured forks per trial; 0 runs in-process
    #[arg(long, short = 'f')]
    pub forks: Option<u32>,

    /// Forks run before the measured ones, results discarded
    #[arg(long)]
    pub warmup_forks: Option<u32>,

    /// Warmup iterations per fork
    #[arg(long, short = 'w')]
    pub warmup_iterations: Option<u32>,

    /// Warmup iteration length, e.g. 500ms
    #[arg(long)]
    pub warmup: Option<String>,

    /// Measurement iterations per fork
    #[arg(long, short = 'i')]
    pub iterations: Option<u32>,

    /// Measurement iteration length, e.g. 1s
    #[arg(long)]
    pub measurement: Option<String>,

    /// Invocations per iteration; replaces the iteration time
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Worker threads when a task declares no groups
    #[arg(long, short = 't')]
    pub threads: Option<u32>,

    /// Thread count per declared group, comma separated
    #[arg(long, value_delimiter = ',')]
    pub thread_groups: Vec<u32>,

    /// Ramp each thread group up from one thread, one more per iteration
    #[arg(long)]
    pub scale: bool,

    /// Benchmark mode: thrpt, avgt, sample, ss or all
    #[arg(long)]
    pub mode: Option<Mode>,

    /// Unit scores are reported in: ns, us, ms, s, m
    #[arg(long)]
    pub time_unit: Option<String>,

    /// Parameter override `name=v1,v2`; repeatable
    #[arg(long = "param", short = 'p', value_parser = parse_param)]
    pub params: Vec<(String, Vec<String>)>,

    /// Attach a profiler by name; repeatable
    #[arg(long = "prof")]
    pub profilers: Vec<String>,

    /// Stop the run at the first failed trial
    #[arg(long)]
    pub fail_on_error: Option<bool>,

    /// Liveness timeout for worker responses, e.g. 10m
    #[arg(long)]
    pub timeout: Option<String>,

    /// Trials run concurrently
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: Run as worker process (used by the supervisor)
    #[arg(long = "trialbench-worker", hide = true)]
    pub worker: bool,

    /// Internal: Absorb cargo bench's --bench flag
    #[arg(long, hide = true)]
    pub bench: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List planned trials and available profilers
    List,
    /// Print a commented default trialbench.toml
    Init,
}

impl Cli {
    /// Runner settings given on the command line
    fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            forks: self.forks,
            warmup_forks: self.warmup_forks,
            warmup_iterations: self.warmup_iterations,
            warmup_time: self.warmup.clone(),
            warmup_batch_size: self.batch_size,
            measurement_iterations: self.iterations,
            measurement_time: self.measurement.clone(),
            measurement_batch_size: self.batch_size,
            threads: self.threads,
            timeout: self.timeout.clone(),
            fail_on_error: self.fail_on_error,
            sync_iterations: None,
            scale: self.scale.then_some(true),
            time_unit: self.time_unit.clone(),
            jobs: self.jobs,
        }
    }
}

/// Run the Trialbench CLI with the process arguments and every task
/// submitted with `inventory::submit!`.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli, &TaskRegistry::discover())
}

/// Run the Trialbench CLI with pre-parsed arguments against `registry`.
pub fn run_with_cli(cli: Cli, registry: &TaskRegistry) -> anyhow::Result<()> {
    // Worker mode first, before anything writes to stdout
    if cli.worker {
        let mut worker = WorkerMain::from_env().context("worker channel unavailable")?;
        return worker.run(registry).context("worker failed");
    }

    let filter = if cli.verbose {
        "trialbench=debug"
    } else {
        "trialbench=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    if let Some(Commands::Init) = cli.command {
        print!("{}", TrialbenchConfig::default_toml());
        return Ok(());
    }

    // trialbench.toml first, command line flags on top
    let config = TrialbenchConfig::discover()?;
    let runner = config.runner.merged(&cli.runner());

    let mut names = config.profilers.enabled.clone();
    for name in &cli.profilers {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    let profilers = ProfilerSelection::resolve(&names, &config.profilers)?;

    let filter = Regex::new(&cli.filter)
        .with_context(|| format!("invalid filter pattern {:?}", cli.filter))?;
    let options = PlanOptions {
        mode: cli.mode,
        thread_groups: cli.thread_groups.clone(),
        params: cli.params.iter().cloned().collect::<BTreeMap<_, _>>(),
        runner: runner.clone(),
        ..PlanOptions::default()
    };
    let plan = build_plan(registry, Some(&filter), &options)?;

    if let Some(Commands::List) = cli.command {
        list_plan(&plan);
        return Ok(());
    }

    if plan.is_empty() {
        println!("No benchmarks found.");
        return Ok(());
    }

    let jobs = runner.jobs.unwrap_or(1).max(1);
    tracing::info!(trials = plan.len(), jobs, "running plan");

    let orchestrator = Orchestrator::new(registry.clone(), profilers)?;
    let progress = ProgressBar::new(plan.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    let results = orchestrator.run_all(&plan.records, jobs, &|trial| {
        progress.set_message(trial.record.label());
        progress.inc(1);
    });
    progress.finish_and_clear();

    let results = results?;
    print!("{}", format_summary(&results));

    let failed = results.iter().filter(|r| r.is_failed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} trials failed", results.len());
    }
    Ok(())
}

fn list_plan(plan: &ExecutionPlan) {
    println!("Trialbench Plan:");
    for record in &plan.records {
        println!("├── {}", record.label());
    }
    println!("{} trials planned.", plan.len());

    println!("Profilers:");
    for (name, kind, description) in available_profilers() {
        println!("├── {name} ({kind}): {description}");
    }
}
