//! CLI command definitions for orch-bench.
//!
//! `run` executes every (orchestrator, task, trial) of a bench config;
//! `score` re-scores trials already persisted under its results directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BenchConfig;
use crate::error::LlmError;
use crate::gateway::GatewayConfig;
use crate::llm::LiteLlmClient;
use crate::sandbox::{DockerEngine, Sandbox, SandboxRunner};
use crate::scoring::{LlmRubricJudge, ScoringPipeline};
use crate::trial::{
    host_user, plan_rescore, plan_trials, score_all, BatchRunner, GitCli, JobFailure,
    RepoCloner, TrialMeta, TrialRunner, TrialRunnerConfig, WorkerPool,
};

/// Benchmark harness for autonomous coding-agent orchestrators.
#[derive(Parser)]
#[command(name = "orch-bench")]
#[command(about = "Run and score sandboxed coding-agent trials")]
#[command(version)]
#[command(
    long_about = "orch-bench runs each configured orchestrator against each task inside an isolated container, records the diff and model-API cost of every trial, and scores trials on tests, static analysis and an LLM-judged rubric.\n\nExample usage:\n  orch-bench run --config bench.yaml --concurrency 4\n  orch-bench score --config bench.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every trial of a bench config.
    Run(RunArgs),

    /// Re-score persisted trials with the current task definitions.
    Score(ScoreArgs),
}

/// Arguments for `orch-bench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Bench config (YAML).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Trials in flight at once; overrides the config.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Trials per (orchestrator, task); overrides the config.
    #[arg(short = 'n', long)]
    pub trials: Option<u32>,

    /// Score each trial as soon as it finishes.
    #[arg(long)]
    pub score: bool,
}

/// Arguments for `orch-bench score`.
#[derive(Parser, Debug)]
pub struct ScoreArgs {
    /// Bench config (YAML).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Trials scored at once; overrides the config.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs an already-parsed CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_trials_command(args).await,
        Commands::Score(args) => run_score_command(args).await,
    }
}

async fn run_trials_command(args: RunArgs) -> anyhow::Result<()> {
    let config = BenchConfig::load(&args.config)?;
    config.log_network_policy();

    let sandbox: Arc<dyn Sandbox> = Arc::new(SandboxRunner::new(Arc::new(DockerEngine::new()?)));
    let cloner: Arc<dyn RepoCloner> = Arc::new(GitCli::new());
    let gateway: Option<GatewayConfig> = config.gateway_with_secrets()?;
    if gateway.is_none() {
        warn!("No gateway configured: trials run without model-API access or cost tracking");
    }

    let runner = Arc::new(TrialRunner::new(
        Arc::clone(&sandbox),
        Arc::clone(&cloner),
        TrialRunnerConfig::new(&config.results_dir).with_budget(config.budget_usd),
    ));
    let pool = WorkerPool::new(args.concurrency.unwrap_or(config.concurrency));
    let mut batch = BatchRunner::new(runner, pool).with_gateway(gateway);
    if args.score {
        batch = batch.with_scoring(Arc::new(build_pipeline(&config, sandbox, cloner)));
    }

    let jobs = plan_trials(
        &config.orchestrators,
        &config.tasks,
        args.trials.unwrap_or(config.trials),
    );
    let total = jobs.len();
    info!(trials = total, results_dir = %config.results_dir.display(), "Starting batch");

    let cancel = shutdown_token();
    let outcome = batch.run(jobs, &cancel).await;

    println!("\n=== Trials ({} of {} succeeded) ===", outcome.results.len(), total);
    print_trials(&outcome.results);
    finish(&outcome.failures, total)
}

async fn run_score_command(args: ScoreArgs) -> anyhow::Result<()> {
    let config = BenchConfig::load(&args.config)?;

    let sandbox: Arc<dyn Sandbox> = Arc::new(SandboxRunner::new(Arc::new(DockerEngine::new()?)));
    let cloner: Arc<dyn RepoCloner> = Arc::new(GitCli::new());
    let pipeline = Arc::new(build_pipeline(&config, sandbox, cloner));

    let jobs = plan_rescore(&config.results_dir, &config.tasks);
    let total = jobs.len();
    if total == 0 {
        println!("No scorable trials under {}", config.results_dir.display());
        return Ok(());
    }
    info!(trials = total, "Re-scoring persisted trials");

    let pool = WorkerPool::new(args.concurrency.unwrap_or(config.concurrency));
    let cancel = shutdown_token();
    let outcome = score_all(pool, pipeline, jobs, &cancel).await;

    println!("\n=== Scored ({} of {}) ===", outcome.results.len(), total);
    print_trials(&outcome.results);
    finish(&outcome.failures, total)
}

/// Builds the scoring pipeline; the rubric judge is enabled when the
/// LiteLLM endpoint is configured in the environment.
fn build_pipeline(
    config: &BenchConfig,
    sandbox: Arc<dyn Sandbox>,
    cloner: Arc<dyn RepoCloner>,
) -> ScoringPipeline {
    let pipeline = ScoringPipeline::new(sandbox, cloner).with_user(host_user());
    match LiteLlmClient::from_env() {
        Ok(client) => {
            let model = config
                .judge_model
                .clone()
                .unwrap_or_else(|| client.default_model().to_string());
            info!(api_base = %client.api_base(), model = %model, "Rubric judge enabled");
            pipeline.with_judge(Arc::new(LlmRubricJudge::new(Arc::new(client), model)))
        }
        Err(LlmError::MissingApiBase) => {
            warn!("LITELLM_API_BASE not set: rubric axis will be skipped");
            pipeline
        }
        Err(e) => {
            warn!(error = %e, "Rubric judge unavailable: rubric axis will be skipped");
            pipeline
        }
    }
}

/// A token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight trials");
            child.cancel();
        }
    });
    token
}

fn print_trials(metas: &[TrialMeta]) {
    let mut metas: Vec<&TrialMeta> = metas.iter().collect();
    metas.sort_by_key(|m| m.id());
    for meta in metas {
        let composite = meta
            .composite
            .map(|c| format!("{c:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<48} {:<10} {:>7.1}s  ${:<8.4} composite {}{}",
            meta.id(),
            meta.exit_reason.as_str(),
            meta.duration_secs,
            meta.cost_usd,
            composite,
            if meta.budget_exceeded { "  [over budget]" } else { "" }
        );
    }
}

fn finish(failures: &[JobFailure], total: usize) -> anyhow::Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    println!("\n=== Failures ({}) ===", failures.len());
    for failure in failures {
        println!("  {failure}");
    }
    anyhow::bail!("{} of {} jobs failed", failures.len(), total)
}
