//! Core trial data model: orchestrators, tasks, scores and the persisted
//! trial record.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::limits::{tier_for_category, ResourceTier};

/// Exit code an adapter uses to signal a voluntary give-up.
pub const GAVE_UP_EXIT_CODE: i64 = 2;

/// A subject under test, wrapped in an adapter executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orchestrator {
    pub name: String,
    /// Host path of the adapter executable.
    pub adapter: PathBuf,
    /// Image the adapter runs in.
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One weighted natural-language rubric criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricCriterion {
    pub name: String,
    pub description: String,
    #[serde(default = "default_criterion_weight")]
    pub weight: f64,
}

fn default_criterion_weight() -> f64 {
    1.0
}

/// Scoring axes a task may weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAxis {
    Tests,
    StaticAnalysis,
    Rubric,
    HiddenTests,
    AgentTests,
    BuildLint,
    CodeMetrics,
}

impl ScoreAxis {
    pub const ALL: [ScoreAxis; 7] = [
        ScoreAxis::Tests,
        ScoreAxis::StaticAnalysis,
        ScoreAxis::Rubric,
        ScoreAxis::HiddenTests,
        ScoreAxis::AgentTests,
        ScoreAxis::BuildLint,
        ScoreAxis::CodeMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreAxis::Tests => "tests",
            ScoreAxis::StaticAnalysis => "static_analysis",
            ScoreAxis::Rubric => "rubric",
            ScoreAxis::HiddenTests => "hidden_tests",
            ScoreAxis::AgentTests => "agent_tests",
            ScoreAxis::BuildLint => "build_lint",
            ScoreAxis::CodeMetrics => "code_metrics",
        }
    }
}

impl fmt::Display for ScoreAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default weights for standard tasks.
pub fn default_weights() -> BTreeMap<ScoreAxis, f64> {
    BTreeMap::from([
        (ScoreAxis::Tests, 0.5),
        (ScoreAxis::StaticAnalysis, 0.2),
        (ScoreAxis::Rubric, 0.3),
    ])
}

/// Default weights for greenfield tasks.
pub fn default_greenfield_weights() -> BTreeMap<ScoreAxis, f64> {
    BTreeMap::from([
        (ScoreAxis::Rubric, 0.3),
        (ScoreAxis::HiddenTests, 0.3),
        (ScoreAxis::AgentTests, 0.15),
        (ScoreAxis::BuildLint, 0.15),
        (ScoreAxis::CodeMetrics, 0.1),
    ])
}

fn default_description_path() -> String {
    "TASK.md".to_string()
}

fn default_validation_timeout_secs() -> u64 {
    900
}

/// A named coding problem pinned to a repository revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub repo: String,
    pub tag: String,
    #[serde(default)]
    pub category: String,
    /// Image the validation commands run in.
    pub validation_image: String,
    #[serde(default)]
    pub install_cmd: Option<String>,
    #[serde(default)]
    pub test_cmd: Option<String>,
    #[serde(default)]
    pub build_cmd: Option<String>,
    #[serde(default)]
    pub lint_cmd: Option<String>,
    /// Regex a lint output line must match to count as an issue.
    #[serde(default)]
    pub lint_issue_pattern: Option<String>,
    /// Workspace-relative path of a JUnit-style XML report written by `test_cmd`.
    #[serde(default)]
    pub test_report: Option<String>,
    #[serde(default)]
    pub rubric: Vec<RubricCriterion>,
    /// Axis weights; empty means the category default.
    #[serde(default)]
    pub weights: BTreeMap<ScoreAxis, f64>,
    #[serde(default)]
    pub greenfield: bool,
    /// Revision holding the hidden tests of a greenfield task.
    #[serde(default)]
    pub validation_tag: Option<String>,
    #[serde(default)]
    pub hidden_test_cmd: Option<String>,
    #[serde(default)]
    pub metrics_cmd: Option<String>,
    /// Repository-relative path of the task description.
    #[serde(default = "default_description_path")]
    pub description_path: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Give validation containers network access (for `install_cmd`).
    #[serde(default)]
    pub validation_network: bool,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
}

impl Task {
    /// Creates a minimal task.
    pub fn new(
        name: impl Into<String>,
        repo: impl Into<String>,
        tag: impl Into<String>,
        validation_image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            repo: repo.into(),
            tag: tag.into(),
            category: String::new(),
            validation_image: validation_image.into(),
            install_cmd: None,
            test_cmd: None,
            build_cmd: None,
            lint_cmd: None,
            lint_issue_pattern: None,
            test_report: None,
            rubric: Vec::new(),
            weights: BTreeMap::new(),
            greenfield: false,
            validation_tag: None,
            hidden_test_cmd: None,
            metrics_cmd: None,
            description_path: default_description_path(),
            timeout_secs: None,
            cpus: None,
            memory_mb: None,
            validation_network: false,
            validation_timeout_secs: default_validation_timeout_secs(),
        }
    }

    /// Effective resource tier: category default plus task overrides.
    pub fn resources(&self) -> ResourceTier {
        tier_for_category(&self.category)
            .with_timeout_override(self.timeout_secs)
            .with_cpu_override(self.cpus)
            .with_memory_override(self.memory_mb)
    }

    /// Configured weights, or the default vector for the task kind.
    pub fn effective_weights(&self) -> BTreeMap<ScoreAxis, f64> {
        if !self.weights.is_empty() {
            self.weights.clone()
        } else if self.greenfield {
            default_greenfield_weights()
        } else {
            default_weights()
        }
    }
}

/// Semantic classification of how a trial's container ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    GaveUp,
    Crashed,
    Timeout,
}

impl ExitReason {
    /// Classifies an exit. A timeout wins regardless of the code.
    pub fn classify(exit_code: i64, timed_out: bool) -> Self {
        if timed_out {
            return ExitReason::Timeout;
        }
        match exit_code {
            0 => ExitReason::Completed,
            GAVE_UP_EXIT_CODE => ExitReason::GaveUp,
            _ => ExitReason::Crashed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::GaveUp => "gave_up",
            ExitReason::Crashed => "crashed",
            ExitReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score of one rubric criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub name: String,
    pub weight: f64,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Per-axis scores. A `None` axis was not run or failed to run; it is
/// excluded from the composite rather than counted as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub tests: Option<f64>,
    #[serde(default)]
    pub static_analysis: Option<f64>,
    #[serde(default)]
    pub rubric: Option<f64>,
    #[serde(default)]
    pub rubric_criteria: Vec<CriterionScore>,
    #[serde(default)]
    pub hidden_tests: Option<f64>,
    #[serde(default)]
    pub agent_tests: Option<f64>,
    /// Informational; not a composite axis.
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub build_lint: Option<f64>,
    #[serde(default)]
    pub code_metrics: Option<f64>,
}

impl Scores {
    /// Returns the score recorded for an axis.
    pub fn axis(&self, axis: ScoreAxis) -> Option<f64> {
        match axis {
            ScoreAxis::Tests => self.tests,
            ScoreAxis::StaticAnalysis => self.static_analysis,
            ScoreAxis::Rubric => self.rubric,
            ScoreAxis::HiddenTests => self.hidden_tests,
            ScoreAxis::AgentTests => self.agent_tests,
            ScoreAxis::BuildLint => self.build_lint,
            ScoreAxis::CodeMetrics => self.code_metrics,
        }
    }
}

/// Durable record of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMeta {
    pub orchestrator: String,
    pub task: String,
    pub trial: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub exit_code: i64,
    pub exit_reason: ExitReason,
    /// Commit the workspace was cloned at; diffs and lint baselines are
    /// taken against it. Records written before it existed fall back to
    /// the task's tag.
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub scores: Scores,
    #[serde(default)]
    pub composite: Option<f64>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub budget_exceeded: bool,
    #[serde(default)]
    pub scored_at: Option<DateTime<Utc>>,
}

impl TrialMeta {
    /// `orchestrator/task/trial-N`, for logs.
    pub fn id(&self) -> String {
        format!("{}/{}/trial-{}", self.orchestrator, self.task, self.trial)
    }
}
