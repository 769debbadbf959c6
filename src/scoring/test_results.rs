//! Test-result parsing into a `[0, 1]` score.
//!
//! Two shapes are supported: free-text runner summaries (pytest, cargo,
//! jest, go, unittest) and JUnit-style XML reports. Absent or empty output
//! from a well-behaved tool is a perfect score, not a failure.

use std::sync::LazyLock;

use regex::Regex;

static PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+) passed\b").expect("valid regex"));
static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+) (?:failed|errors?)\b").expect("valid regex"));
static GO_PASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*--- PASS:").expect("valid regex"));
static GO_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*--- FAIL:").expect("valid regex"));
static UNITTEST_RAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Ran (\d+) tests?\b").expect("valid regex"));
static UNITTEST_FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^FAILED \(([^)]*)\)").expect("valid regex"));
static UNITTEST_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:failures|errors)=(\d+)").expect("valid regex"));

static TESTSUITES_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<testsuites\b[^>]*>").expect("valid regex"));
static TESTSUITE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<testsuite\b[^>]*>").expect("valid regex"));

/// Passed and failed counts found in runner output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u64,
    pub failed: u64,
}

impl TestCounts {
    pub fn total(&self) -> u64 {
        self.passed + self.failed
    }

    /// Pass ratio, or `None` when nothing was counted.
    pub fn ratio(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.passed as f64 / total as f64),
        }
    }
}

fn sum_captures(re: &Regex, text: &str) -> u64 {
    re.captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
        .sum()
}

/// Extracts pass/fail counts from free-text output, or `None` if no
/// summary is recognized.
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    // unittest: "Ran N tests" followed by "OK" or "FAILED (failures=1, errors=2)".
    if let Some(ran) = UNITTEST_RAN_RE.captures(output) {
        let total: u64 = ran.get(1)?.as_str().parse().ok()?;
        let failed: u64 = UNITTEST_FAILED_RE
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| sum_captures(&UNITTEST_COUNT_RE, m.as_str()))
            .unwrap_or(0);
        let failed = failed.min(total);
        return Some(TestCounts {
            passed: total - failed,
            failed,
        });
    }

    // go test -v
    let go_pass = GO_PASS_RE.find_iter(output).count() as u64;
    let go_fail = GO_FAIL_RE.find_iter(output).count() as u64;
    if go_pass + go_fail > 0 {
        return Some(TestCounts {
            passed: go_pass,
            failed: go_fail,
        });
    }

    // pytest / cargo / jest summaries. Jest's suite line repeats the
    // per-test counts at suite granularity.
    let summary: String = output
        .lines()
        .filter(|l| !l.trim_start().starts_with("Test Suites:"))
        .collect::<Vec<_>>()
        .join("\n");
    let counts = TestCounts {
        passed: sum_captures(&PASSED_RE, &summary),
        failed: sum_captures(&FAILED_RE, &summary),
    };
    (counts.total() > 0).then_some(counts)
}

/// Scores free-text output. Without discernible counts a clean exit is
/// 1.0 and a nonzero exit is 0.0.
pub fn score_test_output(output: &str, exit_code: i64) -> f64 {
    match parse_test_counts(output).and_then(|c| c.ratio()) {
        Some(ratio) => ratio,
        None if exit_code == 0 => 1.0,
        None => 0.0,
    }
}

/// Counts from a JUnit-style XML report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JunitCounts {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
}

fn attr(tag: &str, name: &str) -> u64 {
    let pattern = format!(r#"\b{name}\s*=\s*["'](\d+)["']"#);
    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(tag))
        .and_then(|c| c.get(1)?.as_str().parse().ok())
        .unwrap_or(0)
}

fn tag_counts(tag: &str) -> JunitCounts {
    JunitCounts {
        tests: attr(tag, "tests"),
        failures: attr(tag, "failures"),
        errors: attr(tag, "errors"),
    }
}

/// Reads counts from the root `<testsuites>` element, or sums the
/// `<testsuite>` elements when there is no aggregate root.
pub fn parse_junit_counts(xml: &str) -> JunitCounts {
    if let Some(root) = TESTSUITES_TAG_RE.find(xml) {
        let counts = tag_counts(root.as_str());
        if counts.tests > 0 {
            return counts;
        }
    }

    TESTSUITE_TAG_RE
        .find_iter(xml)
        .map(|m| tag_counts(m.as_str()))
        .fold(JunitCounts::default(), |acc, c| JunitCounts {
            tests: acc.tests + c.tests,
            failures: acc.failures + c.failures,
            errors: acc.errors + c.errors,
        })
}

/// Scores a JUnit report: `(tests - failures - errors) / tests`, floored
/// at 0. An empty report, or one with no tests, scores 1.0.
pub fn score_junit_xml(xml: &str) -> f64 {
    let counts = parse_junit_counts(xml);
    if counts.tests == 0 {
        return 1.0;
    }
    let bad = counts.failures + counts.errors;
    (counts.tests.saturating_sub(bad)) as f64 / counts.tests as f64
}

static COVERAGE_TOTAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^TOTAL\b.*?(\d+(?:\.\d+)?)%\s*$").expect("valid regex"));
static COVERAGE_INLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"coverage:\s*(\d+(?:\.\d+)?)%").expect("valid regex"));

/// Parses line coverage from coverage.py (`TOTAL ... 87%`) or go
/// (`coverage: 87.5% of statements`) output, as a `[0, 1]` fraction.
pub fn parse_coverage(output: &str) -> Option<f64> {
    let value = COVERAGE_TOTAL_RE
        .captures_iter(output)
        .last()
        .or_else(|| COVERAGE_INLINE_RE.captures_iter(output).last())?
        .get(1)?
        .as_str()
        .parse::<f64>()
        .ok()?;
    Some((value / 100.0).clamp(0.0, 1.0))
}
