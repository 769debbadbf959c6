//! Static-analysis delta scoring.
//!
//! The lint command runs twice: on the agent's workspace and on the pinned
//! baseline tree. Only net-new issues cost score.

use regex::Regex;

/// Issues per halving of the score: 10 new issues score 0.5.
const ISSUE_SCALE: f64 = 10.0;

/// Counts issue lines in lint output.
///
/// With a pattern, a line counts when it matches; without one, every
/// non-empty line counts.
pub fn count_issues(output: &str, pattern: Option<&Regex>) -> usize {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| pattern.map_or(true, |re| re.is_match(line)))
        .count()
}

/// Issues present now that were not present in the baseline.
pub fn net_new_issues(current: usize, baseline: usize) -> usize {
    current.saturating_sub(baseline)
}

/// Maps a net-new issue count to `[0, 1]`; 1.0 at zero, decreasing
/// towards 0 as `1 / (1 + n / 10)`.
pub fn lint_score(current: usize, baseline: usize) -> f64 {
    let new = net_new_issues(current, baseline) as f64;
    1.0 / (1.0 + new / ISSUE_SCALE)
}

/// Compiles the task's issue pattern, if any.
pub fn issue_pattern(pattern: Option<&str>) -> Result<Option<Regex>, regex::Error> {
    pattern
        .filter(|p| !p.trim().is_empty())
        .map(Regex::new)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_issues_is_perfect() {
        assert_eq!(lint_score(0, 0), 1.0);
        assert_eq!(count_issues("", None), 0);
    }

    #[test]
    fn test_baseline_issues_are_free() {
        assert_eq!(lint_score(5, 5), 1.0);
        assert_eq!(lint_score(3, 7), 1.0);
    }

    #[test]
    fn test_new_issues_decrease_score() {
        assert_eq!(lint_score(10, 0), 0.5);
        assert!(lint_score(2, 0) > lint_score(4, 0));
        assert!(lint_score(1000, 0) > 0.0);
    }

    #[test]
    fn test_count_with_pattern() {
        let output = "src/a.py:1:1: E501 line too long\n\
                      src/b.py:3:5: F401 unused import\n\
                      Found 2 errors.\n\n";
        let re = issue_pattern(Some(r"^\S+:\d+:\d+: ")).unwrap();
        assert_eq!(count_issues(output, re.as_ref()), 2);
        assert_eq!(count_issues(output, None), 3);
    }

    #[test]
    fn test_issue_pattern() {
        assert!(issue_pattern(None).unwrap().is_none());
        assert!(issue_pattern(Some("  ")).unwrap().is_none());
        assert!(issue_pattern(Some("(unclosed")).is_err());
    }
}
