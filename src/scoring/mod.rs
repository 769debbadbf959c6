//! Composite Scoring Pipeline: per-axis scorers and their combination.

pub mod composite;
pub mod lint;
pub mod pipeline;
pub mod rubric;
pub mod test_results;

pub use composite::composite_score;
pub use lint::{count_issues, issue_pattern, lint_score, net_new_issues};
pub use pipeline::{parse_metric, ScoringPipeline, VALIDATION_MOUNT};
pub use rubric::{
    compute_rubric_score, parse_verdict, run_rubric_judge, LlmRubricJudge, RubricJudge, Verdict,
};
pub use test_results::{
    parse_coverage, parse_junit_counts, parse_test_counts, score_junit_xml, score_test_output,
    JunitCounts, TestCounts,
};
