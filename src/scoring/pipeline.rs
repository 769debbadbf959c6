//! Composite Scoring Pipeline.
//!
//! Runs the task's validation commands in its validation image against the
//! post-trial workspace, judges the rubric, and fills a fresh [`Scores`].
//! Every axis is independent: one that fails is logged and left `None`
//! so the composite excludes it instead of counting it as zero.

use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ScoringError;
use crate::sandbox::{Mount, NetworkPolicy, RunOptions, RunOutcome, Sandbox};
use crate::scoring::lint::{count_issues, issue_pattern, lint_score};
use crate::scoring::rubric::{compute_rubric_score, run_rubric_judge, RubricJudge};
use crate::scoring::test_results::{parse_coverage, score_junit_xml, score_test_output};
use crate::trial::git::RepoCloner;
use crate::trial::store::resolve_relative;
use crate::trial::types::{CriterionScore, ScoreAxis, Scores, Task};

/// Mount point of the hidden-test checkout in greenfield validation.
pub const VALIDATION_MOUNT: &str = "/validation";

/// Output lines kept for lint runs, whose whole output is counted.
const LINT_OUTPUT_LINES: usize = 5000;

static LAST_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"));

/// Scores persisted trials.
pub struct ScoringPipeline {
    sandbox: Arc<dyn Sandbox>,
    cloner: Arc<dyn RepoCloner>,
    judge: Option<Arc<dyn RubricJudge>>,
    user: Option<String>,
}

impl ScoringPipeline {
    /// Creates a pipeline without a rubric judge.
    pub fn new(sandbox: Arc<dyn Sandbox>, cloner: Arc<dyn RepoCloner>) -> Self {
        Self {
            sandbox,
            cloner,
            judge: None,
            user: None,
        }
    }

    /// Enables rubric judging.
    pub fn with_judge(mut self, judge: Arc<dyn RubricJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Runs validation containers as this user (`uid:gid`).
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Produces a fresh set of scores for one trial. `base` is the revision
    /// the workspace was cloned at.
    pub async fn score(
        &self,
        task: &Task,
        workspace: &Path,
        base: &str,
        diff: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Scores {
        let mut scores = Scores::default();

        let (rubric, criteria) = self.run_rubric(task, description, diff).await;
        scores.rubric = rubric;
        scores.rubric_criteria = criteria;

        if task.greenfield {
            scores.hidden_tests = recover(
                ScoreAxis::HiddenTests,
                self.run_hidden_tests(task, workspace, cancel).await,
            );
            match self.run_agent_tests(task, workspace, cancel).await {
                Ok(Some((score, coverage))) => {
                    scores.agent_tests = Some(score);
                    scores.coverage = coverage;
                }
                Ok(None) => {}
                Err(e) => warn!(task = %task.name, axis = %ScoreAxis::AgentTests, error = %e, "Scoring axis failed"),
            }
            scores.build_lint = recover(
                ScoreAxis::BuildLint,
                self.run_build_lint(task, workspace, base, cancel).await,
            );
            scores.code_metrics = recover(
                ScoreAxis::CodeMetrics,
                self.run_code_metrics(task, workspace, cancel).await,
            );
        } else {
            scores.tests = recover(
                ScoreAxis::Tests,
                self.run_tests(task, workspace, cancel).await,
            );
            scores.static_analysis = recover(
                ScoreAxis::StaticAnalysis,
                self.run_lint(task, workspace, base, cancel).await,
            );
        }

        info!(
            task = %task.name,
            tests = ?scores.tests,
            static_analysis = ?scores.static_analysis,
            rubric = ?scores.rubric,
            "Scoring finished"
        );
        scores
    }

    /// Runs `test_cmd` and scores its report or output. `None` when the
    /// task has no test command.
    pub async fn run_tests(
        &self,
        task: &Task,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, ScoringError> {
        let Some(test_cmd) = task.test_cmd.as_deref() else {
            return Ok(None);
        };
        let outcome = self
            .validate(task, workspace, test_cmd, Vec::new(), cancel)
            .await?;
        Ok(Some(self.score_test_run(task, workspace, &outcome)))
    }

    fn score_test_run(&self, task: &Task, workspace: &Path, outcome: &RunOutcome) -> f64 {
        if outcome.timed_out {
            return 0.0;
        }
        if let Some(report) = task
            .test_report
            .as_deref()
            .and_then(|r| resolve_relative(workspace, r))
        {
            if let Ok(xml) = std::fs::read_to_string(&report) {
                return score_junit_xml(&xml);
            }
            debug!(report = %report.display(), "Test report absent, using output");
        }
        score_test_output(&outcome.output, outcome.exit_code)
    }

    /// Runs `lint_cmd` on the workspace and on the baseline tree exported
    /// at `base`, and scores net-new issues.
    pub async fn run_lint(
        &self,
        task: &Task,
        workspace: &Path,
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, ScoringError> {
        let Some(lint_cmd) = task.lint_cmd.as_deref() else {
            return Ok(None);
        };
        let pattern = issue_pattern(task.lint_issue_pattern.as_deref())?;

        let current = self.lint_once(task, workspace, lint_cmd, cancel).await?;

        let baseline_dir = tempfile::tempdir()?;
        self.cloner
            .export_tree(workspace, base, baseline_dir.path())
            .await
            .map_err(|e| ScoringError::Checkout(e.to_string()))?;
        let baseline = self
            .lint_once(task, baseline_dir.path(), lint_cmd, cancel)
            .await?;

        let current_issues = count_issues(&current.output, pattern.as_ref());
        let baseline_issues = count_issues(&baseline.output, pattern.as_ref());
        debug!(task = %task.name, current_issues, baseline_issues, "Lint issue counts");
        Ok(Some(lint_score(current_issues, baseline_issues)))
    }

    async fn lint_once(
        &self,
        task: &Task,
        dir: &Path,
        lint_cmd: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ScoringError> {
        let outcome = self
            .run_in_validation(
                self.validation_options(task, dir, lint_cmd)
                    .with_output_tail(LINT_OUTPUT_LINES),
                cancel,
            )
            .await?;
        if outcome.timed_out {
            return Err(ScoringError::NoScore("lint timed out".to_string()));
        }
        Ok(outcome)
    }

    /// Judges every rubric criterion. `(None, [])` without a rubric or judge.
    pub async fn run_rubric(
        &self,
        task: &Task,
        description: &str,
        diff: &str,
    ) -> (Option<f64>, Vec<CriterionScore>) {
        if task.rubric.is_empty() {
            return (None, Vec::new());
        }
        let Some(judge) = self.judge.as_deref() else {
            debug!(task = %task.name, "No rubric judge configured");
            return (None, Vec::new());
        };

        let criteria = run_rubric_judge(judge, &task.rubric, description, diff).await;
        (compute_rubric_score(&criteria), criteria)
    }

    /// Runs `hidden_test_cmd` with the `validation_tag` checkout mounted
    /// read-only at [`VALIDATION_MOUNT`].
    pub async fn run_hidden_tests(
        &self,
        task: &Task,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, ScoringError> {
        let (Some(tag), Some(cmd)) = (task.validation_tag.as_deref(), task.hidden_test_cmd.as_deref())
        else {
            return Ok(None);
        };

        let checkout_root = tempfile::tempdir()?;
        let checkout = checkout_root.path().join("validation");
        self.cloner
            .clone_at(&task.repo, tag, &checkout)
            .await
            .map_err(|e| ScoringError::Checkout(e.to_string()))?;

        let outcome = self
            .validate(
                task,
                workspace,
                cmd,
                vec![Mount::read_only(&checkout, VALIDATION_MOUNT)],
                cancel,
            )
            .await?;
        if outcome.timed_out {
            return Ok(Some(0.0));
        }
        Ok(Some(score_test_output(&outcome.output, outcome.exit_code)))
    }

    /// Runs the agent's own tests; returns the score and parsed coverage.
    pub async fn run_agent_tests(
        &self,
        task: &Task,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<(f64, Option<f64>)>, ScoringError> {
        let Some(test_cmd) = task.test_cmd.as_deref() else {
            return Ok(None);
        };
        let outcome = self
            .validate(task, workspace, test_cmd, Vec::new(), cancel)
            .await?;
        let coverage = parse_coverage(&outcome.output);
        Ok(Some((self.score_test_run(task, workspace, &outcome), coverage)))
    }

    /// 0.0 when the build fails, otherwise the lint score (1.0 without a
    /// lint command). `None` when neither command is configured.
    pub async fn run_build_lint(
        &self,
        task: &Task,
        workspace: &Path,
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, ScoringError> {
        if task.build_cmd.is_none() && task.lint_cmd.is_none() {
            return Ok(None);
        }

        if let Some(build_cmd) = task.build_cmd.as_deref() {
            let outcome = self
                .validate(task, workspace, build_cmd, Vec::new(), cancel)
                .await?;
            if !outcome.success() {
                info!(task = %task.name, exit_code = outcome.exit_code, "Build failed");
                return Ok(Some(0.0));
            }
        }

        Ok(Some(self.run_lint(task, workspace, base, cancel).await?.unwrap_or(1.0)))
    }

    /// Runs `metrics_cmd`; the last number it prints is the score, with
    /// values above 1 read as percentages.
    pub async fn run_code_metrics(
        &self,
        task: &Task,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, ScoringError> {
        let Some(cmd) = task.metrics_cmd.as_deref() else {
            return Ok(None);
        };
        let outcome = self
            .validate(task, workspace, cmd, Vec::new(), cancel)
            .await?;
        if !outcome.success() {
            return Err(ScoringError::NoScore(format!(
                "metrics command exited with {}",
                outcome.exit_code
            )));
        }
        parse_metric(&outcome.output)
            .map(Some)
            .ok_or_else(|| ScoringError::NoScore("no number in metrics output".to_string()))
    }

    fn validation_options(&self, task: &Task, dir: &Path, cmd: &str) -> RunOptions {
        let tier = task.resources();
        let script = match task.install_cmd.as_deref() {
            Some(install) if !install.trim().is_empty() => format!("{install} && {cmd}"),
            _ => cmd.to_string(),
        };
        let network = if task.validation_network {
            NetworkPolicy::Bridge
        } else {
            NetworkPolicy::None
        };

        RunOptions::new(
            task.validation_image.clone(),
            dir,
            Duration::from_secs(task.validation_timeout_secs),
        )
        .with_shell(script)
        .with_network(network)
        .with_cpus(Some(tier.cpu_cores))
        .with_memory_bytes(Some(tier.memory_bytes()))
        .with_user(self.user.clone())
    }

    async fn validate(
        &self,
        task: &Task,
        dir: &Path,
        cmd: &str,
        mounts: Vec<Mount>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ScoringError> {
        let mut opts = self.validation_options(task, dir, cmd);
        opts.mounts.extend(mounts);
        self.run_in_validation(opts, cancel).await
    }

    async fn run_in_validation(
        &self,
        opts: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ScoringError> {
        Ok(self.sandbox.run(opts, cancel).await?)
    }
}

/// Logs a failed axis and records it as missing.
fn recover(axis: ScoreAxis, result: Result<Option<f64>, ScoringError>) -> Option<f64> {
    match result {
        Ok(score) => score,
        Err(e) => {
            warn!(axis = %axis, error = %e, "Scoring axis failed");
            None
        }
    }
}

/// Parses the last number in `output` as a `[0, 1]` metric.
pub fn parse_metric(output: &str) -> Option<f64> {
    let value: f64 = LAST_NUMBER_RE.find_iter(output).last()?.as_str().parse().ok()?;
    let value = if value > 1.0 { value / 100.0 } else { value };
    Some(value.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SandboxError, TrialError};
    use crate::scoring::rubric::Verdict;
    use crate::trial::types::RubricCriterion;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Sandbox fake answering by substring of the shell script.
    struct ScriptedSandbox {
        rules: Vec<(&'static str, i64, &'static str)>,
        runs: Mutex<Vec<RunOptions>>,
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn run(
            &self,
            opts: RunOptions,
            _cancel: &CancellationToken,
        ) -> Result<RunOutcome, SandboxError> {
            let script = opts.command.last().cloned().unwrap_or_default();
            let workspace = opts.workspace.clone();
            self.runs.lock().unwrap().push(opts);
            let (_, code, output) = self
                .rules
                .iter()
                .find(|(needle, _, _)| script.contains(needle))
                .copied()
                .ok_or_else(|| SandboxError::CreateFailed(format!("no rule for {script}")))?;
            // Baseline lint runs see one fewer issue.
            let output = if script.contains("lint") && !workspace.ends_with("ws") {
                output.lines().skip(1).collect::<Vec<_>>().join("\n")
            } else {
                output.to_string()
            };
            Ok(RunOutcome {
                exit_code: code,
                timed_out: false,
                duration: Duration::from_millis(1),
                output,
            })
        }
    }

    #[derive(Default)]
    struct NoopCloner {
        exported: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RepoCloner for NoopCloner {
        async fn clone_at(&self, _repo: &str, _tag: &str, dest: &Path) -> Result<String, TrialError> {
            std::fs::create_dir_all(dest)?;
            Ok("base".to_string())
        }

        async fn stage_and_diff(&self, _workspace: &Path, _base: &str) -> Result<String, TrialError> {
            Ok(String::new())
        }

        async fn export_tree(
            &self,
            _workspace: &Path,
            rev: &str,
            dest: &Path,
        ) -> Result<(), TrialError> {
            self.exported.lock().unwrap().push(rev.to_string());
            std::fs::create_dir_all(dest)?;
            Ok(())
        }
    }

    struct FixedJudge(f64);

    #[async_trait]
    impl RubricJudge for FixedJudge {
        async fn judge(
            &self,
            _criterion: &RubricCriterion,
            _description: &str,
            _diff: &str,
        ) -> Result<Verdict, ScoringError> {
            Ok(Verdict {
                score: self.0,
                reasoning: "fixed".to_string(),
            })
        }
    }

    fn pipeline(rules: Vec<(&'static str, i64, &'static str)>) -> (Arc<ScriptedSandbox>, ScoringPipeline) {
        let sandbox = Arc::new(ScriptedSandbox {
            rules,
            runs: Mutex::new(Vec::new()),
        });
        let pipeline = ScoringPipeline::new(sandbox.clone(), Arc::new(NoopCloner::default()))
            .with_judge(Arc::new(FixedJudge(0.6)));
        (sandbox, pipeline)
    }

    fn task() -> Task {
        let mut task = Task::new("fix", "https://example.com/r.git", "v1", "python:3.11");
        task.test_cmd = Some("pytest -q".to_string());
        task.lint_cmd = Some("ruff lint .".to_string());
        task.rubric = vec![RubricCriterion {
            name: "correctness".to_string(),
            description: "fixes the bug".to_string(),
            weight: 1.0,
        }];
        task
    }

    #[tokio::test]
    async fn test_standard_axes() {
        let (sandbox, pipeline) = pipeline(vec![
            ("pytest", 1, "8 passed, 2 failed in 0.2s"),
            ("lint", 1, "a.py:1: E1\nb.py:2: E2"),
        ]);
        let ws = tempfile::tempdir().unwrap();
        let ws_path = ws.path().join("ws");
        std::fs::create_dir_all(&ws_path).unwrap();

        let scores = pipeline
            .score(&task(), &ws_path, "base", "+fix", "Fix it", &CancellationToken::new())
            .await;

        assert_eq!(scores.tests, Some(0.8));
        // One net-new issue.
        assert!((scores.static_analysis.unwrap() - 1.0 / 1.1).abs() < 1e-9);
        assert_eq!(scores.rubric, Some(0.6));
        assert_eq!(scores.hidden_tests, None);

        let runs = sandbox.runs.lock().unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].network, NetworkPolicy::None);
        assert_eq!(runs[0].command[..2], ["sh".to_string(), "-c".to_string()]);
    }

    #[tokio::test]
    async fn test_lint_baseline_is_exported_at_base_revision() {
        let sandbox = Arc::new(ScriptedSandbox {
            rules: vec![("lint", 0, "")],
            runs: Mutex::new(Vec::new()),
        });
        let cloner = Arc::new(NoopCloner::default());
        let pipeline = ScoringPipeline::new(sandbox, cloner.clone());
        let ws = tempfile::tempdir().unwrap();

        let score = pipeline
            .run_lint(&task(), ws.path(), "0a1b2c3d", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(score, Some(1.0));
        assert_eq!(*cloner.exported.lock().unwrap(), vec!["0a1b2c3d".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_axis_is_none() {
        // No rule matches the lint command: the sandbox errors.
        let (_, pipeline) = pipeline(vec![("pytest", 0, "")]);
        let ws = tempfile::tempdir().unwrap();

        let scores = pipeline
            .score(&task(), ws.path(), "base", "+fix", "Fix it", &CancellationToken::new())
            .await;

        assert_eq!(scores.tests, Some(1.0));
        assert_eq!(scores.static_analysis, None);
    }

    #[tokio::test]
    async fn test_junit_report_preferred() {
        let (_, pipeline) = pipeline(vec![("pytest", 1, "garbage")]);
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(
            ws.path().join("report.xml"),
            r#"<testsuite tests="10" failures="2" errors="1"/>"#,
        )
        .unwrap();
        let mut task = task();
        task.test_report = Some("report.xml".to_string());

        let score = pipeline
            .run_tests(&task, ws.path(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_install_prefix() {
        let (sandbox, pipeline) = pipeline(vec![("pytest", 0, "")]);
        let ws = tempfile::tempdir().unwrap();
        let mut task = task();
        task.install_cmd = Some("pip install -e .".to_string());
        task.validation_network = true;

        pipeline
            .run_tests(&task, ws.path(), &CancellationToken::new())
            .await
            .unwrap();

        let runs = sandbox.runs.lock().unwrap();
        assert_eq!(runs[0].command[2], "pip install -e . && pytest -q");
        assert_eq!(runs[0].network, NetworkPolicy::Bridge);
    }

    #[tokio::test]
    async fn test_greenfield_axes() {
        let (sandbox, pipeline) = pipeline(vec![
            ("hidden", 1, "3 passed, 1 failed"),
            ("pytest", 0, "5 passed\nTOTAL    40    8    80%"),
            ("make build", 2, "error"),
            ("metrics", 0, "maintainability: 72"),
        ]);
        let ws = tempfile::tempdir().unwrap();
        let mut task = task();
        task.greenfield = true;
        task.validation_tag = Some("validation".to_string());
        task.hidden_test_cmd = Some("pytest /validation/hidden".to_string());
        task.build_cmd = Some("make build".to_string());
        task.metrics_cmd = Some("./metrics.sh".to_string());

        let scores = pipeline
            .score(&task, ws.path(), "base", "+code", "Build it", &CancellationToken::new())
            .await;

        // Rules match in order, so the hidden command hits "hidden" first.
        assert_eq!(scores.hidden_tests, Some(0.75));
        assert_eq!(scores.agent_tests, Some(1.0));
        assert_eq!(scores.coverage, Some(0.8));
        assert_eq!(scores.build_lint, Some(0.0));
        assert_eq!(scores.code_metrics, Some(0.72));
        assert_eq!(scores.tests, None);

        let runs = sandbox.runs.lock().unwrap();
        let hidden = runs
            .iter()
            .find(|r| r.command[2].contains("hidden"))
            .unwrap();
        assert!(hidden
            .mounts
            .iter()
            .any(|m| m.container == VALIDATION_MOUNT && m.read_only));
    }

    #[test]
    fn test_parse_metric() {
        assert_eq!(parse_metric("score: 0.85"), Some(0.85));
        assert_eq!(parse_metric("a 1 b 2 final 85"), Some(0.85));
        assert_eq!(parse_metric("150"), Some(1.0));
        assert_eq!(parse_metric("no digits"), None);
    }
}
