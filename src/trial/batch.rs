//! Batches of trials and re-scoring passes over the worker pool.
//!
//! Each trial job owns its gateway: started before the adapter runs,
//! stopped after, whatever the outcome.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TrialError;
use crate::gateway::{Gateway, GatewayConfig, UsageSource};
use crate::scoring::ScoringPipeline;
use crate::trial::pool::{PoolOutcome, WorkerPool};
use crate::trial::runner::{validate_and_score, TrialRunner};
use crate::trial::store::{discover_trials, TrialDir};
use crate::trial::types::{Orchestrator, Task, TrialMeta};

/// One `(orchestrator, task, trial)` to execute.
#[derive(Debug, Clone)]
pub struct TrialJob {
    pub orchestrator: Arc<Orchestrator>,
    pub task: Arc<Task>,
    pub trial: u32,
}

impl fmt::Display for TrialJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/trial-{}",
            self.orchestrator.name, self.task.name, self.trial
        )
    }
}

/// The cross product of orchestrators, tasks and trial numbers `1..=trials`.
pub fn plan_trials(orchestrators: &[Orchestrator], tasks: &[Task], trials: u32) -> Vec<TrialJob> {
    let tasks: Vec<Arc<Task>> = tasks.iter().cloned().map(Arc::new).collect();
    let mut jobs = Vec::with_capacity(orchestrators.len() * tasks.len() * trials as usize);
    for orchestrator in orchestrators {
        let orchestrator = Arc::new(orchestrator.clone());
        for task in &tasks {
            for trial in 1..=trials {
                jobs.push(TrialJob {
                    orchestrator: Arc::clone(&orchestrator),
                    task: Arc::clone(task),
                    trial,
                });
            }
        }
    }
    jobs
}

/// A persisted trial to (re-)score.
#[derive(Debug, Clone)]
pub struct ScoreJob {
    pub dir: TrialDir,
    pub task: Arc<Task>,
}

impl fmt::Display for ScoreJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir.root().display())
    }
}

/// Every persisted trial under `results_dir` whose task is in `tasks`.
pub fn plan_rescore(results_dir: &Path, tasks: &[Task]) -> Vec<ScoreJob> {
    let tasks: Vec<Arc<Task>> = tasks.iter().cloned().map(Arc::new).collect();
    discover_trials(results_dir)
        .into_iter()
        .filter_map(|dir| {
            let meta = match dir.read_meta() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(dir = %dir.root().display(), error = %e, "Unreadable trial record");
                    return None;
                }
            };
            match tasks.iter().find(|t| t.name == meta.task) {
                Some(task) => Some(ScoreJob {
                    dir,
                    task: Arc::clone(task),
                }),
                None => {
                    debug!(trial = %meta.id(), "Task not configured, skipping");
                    None
                }
            }
        })
        .collect()
}

/// Runs batches of trials.
pub struct BatchRunner {
    runner: Arc<TrialRunner>,
    gateway: Option<GatewayConfig>,
    scoring: Option<Arc<ScoringPipeline>>,
    pool: WorkerPool,
}

impl BatchRunner {
    pub fn new(runner: Arc<TrialRunner>, pool: WorkerPool) -> Self {
        Self {
            runner,
            gateway: None,
            scoring: None,
            pool,
        }
    }

    /// Starts a gateway per trial from this config.
    pub fn with_gateway(mut self, gateway: Option<GatewayConfig>) -> Self {
        self.gateway = gateway;
        self
    }

    /// Scores each trial right after it runs.
    pub fn with_scoring(mut self, pipeline: Arc<ScoringPipeline>) -> Self {
        self.scoring = Some(pipeline);
        self
    }

    /// Runs every job; failures are collected, never fatal to the batch.
    pub async fn run(&self, jobs: Vec<TrialJob>, cancel: &CancellationToken) -> PoolOutcome<TrialMeta> {
        let runner = Arc::clone(&self.runner);
        let gateway = self.gateway.clone().map(Arc::new);
        let scoring = self.scoring.clone();
        let token = cancel.clone();

        self.pool
            .run(jobs, cancel, move |job: TrialJob| {
                let runner = Arc::clone(&runner);
                let gateway = gateway.clone();
                let scoring = scoring.clone();
                let cancel = token.clone();
                async move {
                    execute_trial(&runner, gateway.as_deref(), scoring.as_deref(), &job, &cancel).await
                }
            })
            .await
    }
}

async fn execute_trial(
    runner: &TrialRunner,
    gateway_config: Option<&GatewayConfig>,
    scoring: Option<&ScoringPipeline>,
    job: &TrialJob,
    cancel: &CancellationToken,
) -> Result<TrialMeta, TrialError> {
    let dir = runner.trial_dir(&job.orchestrator.name, &job.task.name, job.trial);
    if dir.workspace().exists() {
        return Err(TrialError::TrialDirExists(dir.root().to_path_buf()));
    }

    let mut gateway = match gateway_config {
        Some(config) => {
            std::fs::create_dir_all(dir.root())?;
            Some(Gateway::start(config, dir.gateway_log()).await?)
        }
        None => None,
    };

    let result = runner
        .run_trial(
            &job.orchestrator,
            &job.task,
            job.trial,
            gateway.as_ref().map(|g| g as &dyn UsageSource),
            cancel,
        )
        .await;

    if let Some(gateway) = gateway.as_mut() {
        gateway.stop().await;
    }
    let meta = result?;

    match scoring {
        Some(pipeline) => match validate_and_score(&dir, &job.task, pipeline, cancel).await {
            Ok(scored) => Ok(scored),
            Err(e) => {
                warn!(trial = %job, error = %e, "Inline scoring failed, trial left unscored");
                Ok(meta)
            }
        },
        None => Ok(meta),
    }
}

/// Scores persisted trials through the pool.
pub async fn score_all(
    pool: WorkerPool,
    pipeline: Arc<ScoringPipeline>,
    jobs: Vec<ScoreJob>,
    cancel: &CancellationToken,
) -> PoolOutcome<TrialMeta> {
    let token = cancel.clone();
    pool.run(jobs, cancel, move |job: ScoreJob| {
        let pipeline = Arc::clone(&pipeline);
        let cancel = token.clone();
        async move { validate_and_score(&job.dir, &job.task, &pipeline, &cancel).await }
    })
    .await
}
