//! Usage reconstruction from the gateway's newline-delimited JSON log.
//!
//! The proxy interleaves startup noise with usage lines, so parsing is
//! try-parse-or-skip: malformed lines and lines without a model are
//! dropped.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::gateway::pricing::estimate_cost;

/// One gateway-observed API call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Token and cost totals for a window of the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cost_usd: f64,
}

impl UsageSummary {
    /// Summarizes records, pricing each by model family.
    pub fn from_records(records: &[UsageRecord]) -> Self {
        let mut summary = Self {
            calls: records.len(),
            cost_usd: estimate_cost(records),
            ..Default::default()
        };
        for r in records {
            summary.input_tokens += r.input_tokens;
            summary.output_tokens += r.output_tokens;
            summary.cache_creation_input_tokens += r.cache_creation_input_tokens;
            summary.cache_read_input_tokens += r.cache_read_input_tokens;
        }
        summary
    }

    /// Input plus output tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Parses usage lines, silently skipping anything that is not one.
pub fn parse_usage_logs(content: &str) -> Vec<UsageRecord> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<UsageRecord>(line).ok())
        .filter(|record| !record.model.trim().is_empty())
        .collect()
}

/// Reads and parses the log starting at byte `offset`.
///
/// A missing log yields no records. An offset past the end (log rotated or
/// truncated) restarts from the beginning.
pub fn read_usage_since(path: &Path, offset: u64) -> std::io::Result<Vec<UsageRecord>> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    let start = if offset > len { 0 } else { offset };
    file.seek(SeekFrom::Start(start))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(parse_usage_logs(&String::from_utf8_lossy(&bytes)))
}

/// Current length of the log, used as a window mark.
pub fn log_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LOG: &str = r#"INFO: proxy starting on port 4000
{"provider":"anthropic","model":"claude-sonnet-4","input_tokens":100,"output_tokens":50,"cache_read_input_tokens":10}
not json at all
{"provider":"openai","input_tokens":5}
{"provider":"openai","model":"","input_tokens":5}
{"provider":"openai","model":"gpt-4o","input_tokens":200,"output_tokens":20,"cache_creation_input_tokens":7}
{"broken":
"#;

    #[test]
    fn test_parse_skips_noise() {
        let records = parse_usage_logs(LOG);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].model, "claude-sonnet-4");
        assert_eq!(records[0].cache_read_input_tokens, 10);
        assert_eq!(records[0].cache_creation_input_tokens, 0);
        assert_eq!(records[1].provider, "openai");
        assert_eq!(records[1].cache_creation_input_tokens, 7);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_usage_logs("").is_empty());
    }

    #[test]
    fn test_summary_totals() {
        let summary = UsageSummary::from_records(&parse_usage_logs(LOG));
        assert_eq!(summary.calls, 2);
        assert_eq!(summary.input_tokens, 300);
        assert_eq!(summary.output_tokens, 70);
        assert_eq!(summary.total_tokens(), 370);
        assert!(summary.cost_usd > 0.0);
    }

    #[test]
    fn test_read_since_offset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"provider":"a","model":"haiku","input_tokens":1}}"#).unwrap();
        let mark = log_len(file.path());
        writeln!(file, r#"{{"provider":"a","model":"haiku","input_tokens":2}}"#).unwrap();
        file.flush().unwrap();

        let all = read_usage_since(file.path(), 0).unwrap();
        assert_eq!(all.len(), 2);

        let window = read_usage_since(file.path(), mark).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].input_tokens, 2);

        let rotated = read_usage_since(file.path(), mark * 100).unwrap();
        assert_eq!(rotated.len(), 2);
    }

    #[test]
    fn test_read_missing_file() {
        let records = read_usage_since(Path::new("/nonexistent/gateway.log"), 0).unwrap();
        assert!(records.is_empty());
        assert_eq!(log_len(Path::new("/nonexistent/gateway.log")), 0);
    }
}
