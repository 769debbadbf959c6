//! Trial Orchestrator: clone, run the adapter, capture the diff, persist.
//!
//! [`TrialRunner::run_trial`] executes one trial and writes its
//! [`TrialMeta`]. Scoring is a separate, repeatable pass:
//! [`validate_and_score`] re-reads a persisted trial and overwrites its
//! scores.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SandboxError, TrialError};
use crate::gateway::{rewrite_host, UsageSource, UsageSummary};
use crate::sandbox::{Mount, NetworkPolicy, RunOptions, Sandbox, HOST_GATEWAY_ALIAS, WORKSPACE_MOUNT};
use crate::scoring::{composite_score, ScoringPipeline};
use crate::trial::git::RepoCloner;
use crate::trial::store::{resolve_relative, TrialDir};
use crate::trial::types::{ExitReason, Orchestrator, Task, TrialMeta};

/// Adapter executable path inside the container.
pub const ADAPTER_MOUNT: &str = "/adapter/run";
/// Task description path inside the container.
pub const TASK_MOUNT: &str = "/task/TASK.md";
/// Adapter output directory inside the container.
pub const OUT_MOUNT: &str = "/out";

pub const ENV_WORKSPACE: &str = "ORCHBENCH_WORKSPACE";
pub const ENV_TASK_FILE: &str = "ORCHBENCH_TASK_FILE";
pub const ENV_METRICS_FILE: &str = "ORCHBENCH_METRICS_FILE";
pub const ENV_PROXY_URL: &str = "ORCHBENCH_PROXY_URL";

/// Runtime settings of the trial runner.
#[derive(Debug, Clone)]
pub struct TrialRunnerConfig {
    /// Root of all trial directories.
    pub results_dir: PathBuf,
    /// Per-trial cost ceiling in USD.
    pub budget_usd: Option<f64>,
    /// Run containers as the invoking user's uid:gid.
    pub run_as_host_user: bool,
}

impl TrialRunnerConfig {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            budget_usd: None,
            run_as_host_user: true,
        }
    }

    /// Sets the per-trial budget.
    pub fn with_budget(mut self, budget_usd: Option<f64>) -> Self {
        self.budget_usd = budget_usd;
        self
    }

    /// Enables or disables running as the host user.
    pub fn with_host_user(mut self, enabled: bool) -> Self {
        self.run_as_host_user = enabled;
        self
    }
}

/// The invoking user's `uid:gid`.
#[cfg(unix)]
pub fn host_user() -> Option<String> {
    // SAFETY: getuid and getgid have no preconditions and never fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(format!("{uid}:{gid}"))
}

#[cfg(not(unix))]
pub fn host_user() -> Option<String> {
    None
}

/// Executes trials.
pub struct TrialRunner {
    sandbox: Arc<dyn Sandbox>,
    cloner: Arc<dyn RepoCloner>,
    config: TrialRunnerConfig,
}

impl TrialRunner {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        cloner: Arc<dyn RepoCloner>,
        config: TrialRunnerConfig,
    ) -> Self {
        Self {
            sandbox,
            cloner,
            config,
        }
    }

    pub fn config(&self) -> &TrialRunnerConfig {
        &self.config
    }

    /// Directory of `(orchestrator, task, trial)` under the results root.
    pub fn trial_dir(&self, orchestrator: &str, task: &str, trial: u32) -> TrialDir {
        TrialDir::new(&self.config.results_dir, orchestrator, task, trial)
    }

    /// Runs one trial and persists its record.
    ///
    /// Setup failures (missing adapter, bad repo or tag, clone or container
    /// creation failure) return an error and write no record. How the
    /// adapter exits is never an error; it is classified into
    /// [`ExitReason`].
    pub async fn run_trial(
        &self,
        orchestrator: &Orchestrator,
        task: &Task,
        trial: u32,
        gateway: Option<&dyn UsageSource>,
        cancel: &CancellationToken,
    ) -> Result<TrialMeta, TrialError> {
        let started_at = Utc::now();
        info!(orchestrator = %orchestrator.name, task = %task.name, trial, "Starting trial");

        let adapter = std::fs::canonicalize(&orchestrator.adapter)
            .map_err(|_| TrialError::AdapterMissing(orchestrator.adapter.clone()))?;

        let dir = self.trial_dir(&orchestrator.name, &task.name, trial);
        dir.allocate()?;
        let dir = TrialDir::from_path(std::fs::canonicalize(dir.root())?);
        let workspace = dir.workspace();

        let base_commit = self.cloner.clone_at(&task.repo, &task.tag, &workspace).await?;
        snapshot_description(task, &workspace, &dir.task_file())?;

        let mut opts = self
            .adapter_options(orchestrator, task, &adapter, &dir)
            .with_network(NetworkPolicy::Isolated {
                gateway: gateway.is_some(),
            });

        let mark = match gateway {
            Some(gw) => {
                let url = rewrite_host(&gw.url(), HOST_GATEWAY_ALIAS)?;
                opts = opts.with_env(ENV_PROXY_URL, url);
                gw.usage_mark()
            }
            None => 0,
        };

        let outcome = self.sandbox.run(opts, cancel).await?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled.into());
        }

        let diff = self.cloner.stage_and_diff(&workspace, &base_commit).await?;
        std::fs::write(dir.diff_file(), &diff)?;
        debug!(bytes = diff.len(), "Captured diff");

        let usage = match gateway {
            Some(gw) => gw.usage_since(mark).await.unwrap_or_else(|e| {
                warn!(task = %task.name, error = %e, "Failed to read gateway usage");
                UsageSummary::default()
            }),
            None => UsageSummary::default(),
        };

        let exit_reason = ExitReason::classify(outcome.exit_code, outcome.timed_out);
        let budget_exceeded = self
            .config
            .budget_usd
            .is_some_and(|budget| usage.cost_usd > budget);

        let meta = TrialMeta {
            orchestrator: orchestrator.name.clone(),
            task: task.name.clone(),
            trial,
            started_at,
            finished_at: Utc::now(),
            duration_secs: outcome.duration.as_secs_f64(),
            exit_code: outcome.exit_code,
            exit_reason,
            base_commit: Some(base_commit),
            scores: Default::default(),
            composite: None,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens(),
            cost_usd: usage.cost_usd,
            budget_exceeded,
            scored_at: None,
        };
        dir.write_meta(&meta)?;

        info!(
            trial = %meta.id(),
            exit_code = meta.exit_code,
            exit_reason = %meta.exit_reason,
            duration_secs = meta.duration_secs,
            cost_usd = meta.cost_usd,
            "Trial finished"
        );
        Ok(meta)
    }

    fn adapter_options(
        &self,
        orchestrator: &Orchestrator,
        task: &Task,
        adapter: &Path,
        dir: &TrialDir,
    ) -> RunOptions {
        let tier = task.resources();
        let user = if self.config.run_as_host_user {
            host_user()
        } else {
            None
        };

        RunOptions::new(orchestrator.image.clone(), dir.workspace(), tier.timeout())
            .with_command([ADAPTER_MOUNT])
            .with_mount(Mount::read_only(adapter, ADAPTER_MOUNT))
            .with_mount(Mount::read_only(dir.task_file(), TASK_MOUNT))
            .with_mount(Mount::read_write(dir.adapter_out(), OUT_MOUNT))
            .with_envs(&orchestrator.env)
            .with_env(ENV_WORKSPACE, WORKSPACE_MOUNT)
            .with_env(ENV_TASK_FILE, TASK_MOUNT)
            .with_env(ENV_METRICS_FILE, format!("{OUT_MOUNT}/metrics.json"))
            .with_cpus(Some(tier.cpu_cores))
            .with_memory_bytes(Some(tier.memory_bytes()))
            .with_user(user)
    }
}

/// Copies the task's description out of the cloned tree, or writes a
/// placeholder when the repository has none.
fn snapshot_description(task: &Task, workspace: &Path, dest: &Path) -> Result<(), TrialError> {
    let source = resolve_relative(workspace, &task.description_path).filter(|p| p.is_file());
    match source {
        Some(path) => {
            std::fs::copy(&path, dest)?;
        }
        None => {
            warn!(task = %task.name, path = %task.description_path, "Task description not found, using placeholder");
            std::fs::write(
                dest,
                format!(
                    "# {}\n\nNo task description was found at `{}` in the repository.\n",
                    task.name, task.description_path
                ),
            )?;
        }
    }
    Ok(())
}

/// Scores a persisted trial and rewrites its record.
///
/// Every call computes scores from scratch and replaces the previous ones,
/// so repeated calls with unchanged inputs produce the same record apart
/// from `scored_at`.
pub async fn validate_and_score(
    dir: &TrialDir,
    task: &Task,
    pipeline: &ScoringPipeline,
    cancel: &CancellationToken,
) -> Result<TrialMeta, TrialError> {
    let mut meta = dir.read_meta()?;
    let diff = dir.read_diff()?;
    let description = dir.read_task()?;
    let workspace = std::fs::canonicalize(dir.workspace())?;
    let base = meta.base_commit.as_deref().unwrap_or(&task.tag);

    let scores = pipeline
        .score(task, &workspace, base, &diff, &description, cancel)
        .await;
    if cancel.is_cancelled() {
        return Err(SandboxError::Cancelled.into());
    }

    meta.composite = composite_score(&scores, &task.effective_weights());
    meta.scores = scores;
    meta.scored_at = Some(Utc::now());
    dir.write_meta(&meta)?;

    info!(trial = %meta.id(), composite = ?meta.composite, "Trial scored");
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::sandbox::{RunOutcome, TIMEOUT_EXIT_CODE};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeSandbox {
        exit_code: i64,
        timed_out: bool,
        seen: Mutex<Option<RunOptions>>,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn run(
            &self,
            opts: RunOptions,
            _cancel: &CancellationToken,
        ) -> Result<RunOutcome, SandboxError> {
            std::fs::write(opts.workspace.join("edited.txt"), "agent was here").unwrap();
            *self.seen.lock().unwrap() = Some(opts);
            Ok(RunOutcome {
                exit_code: self.exit_code,
                timed_out: self.timed_out,
                duration: Duration::from_secs(3),
                output: String::new(),
            })
        }
    }

    struct FakeCloner {
        with_description: bool,
    }

    #[async_trait]
    impl RepoCloner for FakeCloner {
        async fn clone_at(&self, _repo: &str, _tag: &str, dest: &Path) -> Result<String, TrialError> {
            std::fs::create_dir_all(dest)?;
            if self.with_description {
                std::fs::write(dest.join("TASK.md"), "Fix the parser")?;
            }
            Ok("base-sha".to_string())
        }

        async fn stage_and_diff(&self, workspace: &Path, base: &str) -> Result<String, TrialError> {
            assert_eq!(base, "base-sha");
            Ok(if workspace.join("edited.txt").exists() {
                "+agent was here\n".to_string()
            } else {
                String::new()
            })
        }

        async fn export_tree(
            &self,
            _workspace: &Path,
            _rev: &str,
            dest: &Path,
        ) -> Result<(), TrialError> {
            std::fs::create_dir_all(dest)?;
            Ok(())
        }
    }

    struct FakeGateway;

    #[async_trait]
    impl UsageSource for FakeGateway {
        fn url(&self) -> String {
            "http://localhost:4000".to_string()
        }

        fn usage_mark(&self) -> u64 {
            7
        }

        async fn usage_since(&self, mark: u64) -> Result<UsageSummary, GatewayError> {
            assert_eq!(mark, 7);
            Ok(UsageSummary {
                calls: 2,
                input_tokens: 1000,
                output_tokens: 200,
                cost_usd: 1.5,
                ..Default::default()
            })
        }
    }

    fn setup(
        exit_code: i64,
        timed_out: bool,
        with_description: bool,
    ) -> (tempfile::TempDir, Arc<FakeSandbox>, TrialRunner, Orchestrator) {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = tmp.path().join("adapter.sh");
        std::fs::write(&adapter, "#!/bin/sh\nexit 0\n").unwrap();
        let sandbox = Arc::new(FakeSandbox {
            exit_code,
            timed_out,
            seen: Mutex::new(None),
        });
        let runner = TrialRunner::new(
            sandbox.clone(),
            Arc::new(FakeCloner { with_description }),
            TrialRunnerConfig::new(tmp.path().join("results")).with_budget(Some(1.0)),
        );
        let orchestrator = Orchestrator {
            name: "alpha".to_string(),
            adapter,
            image: "agent:latest".to_string(),
            env: BTreeMap::from([("AGENT_MODE".to_string(), "fast".to_string())]),
        };
        (tmp, sandbox, runner, orchestrator)
    }

    fn task() -> Task {
        Task::new("fix-parser", "https://example.com/r.git", "v1.0", "python:3.11")
    }

    #[tokio::test]
    async fn test_run_trial_persists_meta() {
        let (_tmp, sandbox, runner, orchestrator) = setup(2, false, true);

        let meta = runner
            .run_trial(&orchestrator, &task(), 1, Some(&FakeGateway), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(meta.exit_reason, ExitReason::GaveUp);
        assert_eq!(meta.total_tokens, 1200);
        assert!(meta.budget_exceeded);

        let dir = runner.trial_dir("alpha", "fix-parser", 1);
        assert_eq!(dir.read_meta().unwrap(), meta);
        assert_eq!(dir.read_diff().unwrap(), "+agent was here\n");
        assert_eq!(dir.read_task().unwrap(), "Fix the parser");

        let opts = sandbox.seen.lock().unwrap().clone().unwrap();
        assert_eq!(opts.command, vec![ADAPTER_MOUNT.to_string()]);
        assert_eq!(opts.network, NetworkPolicy::Isolated { gateway: true });
        assert_eq!(opts.env["AGENT_MODE"], "fast");
        assert_eq!(opts.env[ENV_TASK_FILE], TASK_MOUNT);
        assert_eq!(opts.env[ENV_PROXY_URL], "http://host.docker.internal:4000");
        assert!(opts
            .mounts
            .iter()
            .any(|m| m.container == ADAPTER_MOUNT && m.read_only));
    }

    #[tokio::test]
    async fn test_timeout_and_placeholder_description() {
        let (_tmp, sandbox, runner, orchestrator) = setup(TIMEOUT_EXIT_CODE, true, false);

        let meta = runner
            .run_trial(&orchestrator, &task(), 1, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(meta.exit_reason, ExitReason::Timeout);
        assert_eq!(meta.cost_usd, 0.0);
        assert!(!meta.budget_exceeded);
        let description = runner.trial_dir("alpha", "fix-parser", 1).read_task().unwrap();
        assert!(description.contains("No task description"));
        let opts = sandbox.seen.lock().unwrap().clone().unwrap();
        assert_eq!(opts.network, NetworkPolicy::Isolated { gateway: false });
        assert!(!opts.env.contains_key(ENV_PROXY_URL));
    }

    #[tokio::test]
    async fn test_missing_adapter_writes_nothing() {
        let (_tmp, sandbox, runner, mut orchestrator) = setup(0, false, true);
        orchestrator.adapter = PathBuf::from("/nonexistent/adapter");

        let err = runner
            .run_trial(&orchestrator, &task(), 1, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TrialError::AdapterMissing(_)));
        assert!(sandbox.seen.lock().unwrap().is_none());
        assert!(!runner.trial_dir("alpha", "fix-parser", 1).meta_file().exists());
    }

    #[tokio::test]
    async fn test_trial_dir_is_never_reused() {
        let (_tmp, _sandbox, runner, orchestrator) = setup(0, false, true);
        let cancel = CancellationToken::new();

        runner
            .run_trial(&orchestrator, &task(), 1, None, &cancel)
            .await
            .unwrap();
        let err = runner
            .run_trial(&orchestrator, &task(), 1, None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, TrialError::TrialDirExists(_)));
    }

    #[test]
    fn test_description_traversal_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(tmp.path().join("secret"), "hunter2").unwrap();
        let mut task = task();
        task.description_path = "../secret".to_string();

        let dest = tmp.path().join("task.md");
        snapshot_description(&task, &workspace, &dest).unwrap();

        let written = std::fs::read_to_string(dest).unwrap();
        assert!(!written.contains("hunter2"));
    }
}
