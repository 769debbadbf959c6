//! Trial Orchestrator.
//!
//! Sequences one trial (clone, run adapter, diff, usage, classify,
//! persist), re-scores persisted trials, and fans batches out over a
//! bounded worker pool.

pub mod batch;
pub mod git;
pub mod pool;
pub mod runner;
pub mod store;
pub mod types;

pub use batch::{plan_rescore, plan_trials, score_all, BatchRunner, ScoreJob, TrialJob};
pub use git::{validate_repo, validate_tag, GitCli, RepoCloner};
pub use pool::{JobFailure, PoolOutcome, WorkerPool};
pub use runner::{host_user, validate_and_score, TrialRunner, TrialRunnerConfig};
pub use store::{discover_trials, TrialDir};
pub use types::{
    default_greenfield_weights, default_weights, CriterionScore, ExitReason, Orchestrator,
    RubricCriterion, ScoreAxis, Scores, Task, TrialMeta,
};
