//! Resource tiers for sandboxed trial execution.
//!
//! A task's category picks the wall-clock budget and default CPU/memory
//! limits; task-level overrides win over the tier.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// CFS period used for CPU quotas, in microseconds (100ms).
pub const CPU_PERIOD_US: i64 = 100_000;

/// Default pids limit applied to every sandbox.
pub const DEFAULT_PIDS_LIMIT: i64 = 1024;

/// Resource limits for one sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTier {
    /// Wall-clock timeout in seconds before the container is killed.
    pub timeout_seconds: u64,
    /// CPU cores available (fractions allowed, e.g. 0.5).
    pub cpu_cores: f64,
    /// Memory limit in megabytes.
    pub memory_mb: u64,
}

impl Default for ResourceTier {
    fn default() -> Self {
        Self {
            timeout_seconds: 1800, // 30 minutes
            cpu_cores: 2.0,
            memory_mb: 4096,
        }
    }
}

impl ResourceTier {
    /// Creates a tier with the given parameters.
    pub fn new(timeout_seconds: u64, cpu_cores: f64, memory_mb: u64) -> Self {
        Self {
            timeout_seconds,
            cpu_cores,
            memory_mb,
        }
    }

    /// Returns the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Overrides the timeout when `Some`.
    pub fn with_timeout_override(mut self, seconds: Option<u64>) -> Self {
        if let Some(s) = seconds {
            self.timeout_seconds = s;
        }
        self
    }

    /// Overrides the CPU budget when `Some`.
    pub fn with_cpu_override(mut self, cores: Option<f64>) -> Self {
        if let Some(c) = cores {
            self.cpu_cores = c;
        }
        self
    }

    /// Overrides the memory limit when `Some`.
    pub fn with_memory_override(mut self, mb: Option<u64>) -> Self {
        if let Some(m) = mb {
            self.memory_mb = m;
        }
        self
    }
}

/// Returns CPU quota for the given number of cores.
///
/// Formula: quota = period * cores, e.g. 0.5 core = 50000.
pub fn cpu_quota(cores: f64) -> i64 {
    (CPU_PERIOD_US as f64 * cores) as i64
}

/// Get the resource tier for a task category.
///
/// Supported categories:
/// - "bugfix" - small, targeted changes
/// - "feature" / "refactor" - standard multi-file work
/// - "greenfield" - building a project from an empty tree
///
/// Unknown categories get the default (30 minute) tier.
///
/// # Example
///
/// ```
/// use orch_bench::sandbox::tier_for_category;
///
/// let tier = tier_for_category("greenfield");
/// assert_eq!(tier.timeout_seconds, 3600);
/// ```
pub fn tier_for_category(category: &str) -> ResourceTier {
    match category.to_lowercase().as_str() {
        "bugfix" => ResourceTier {
            timeout_seconds: 900, // 15 minutes
            cpu_cores: 2.0,
            memory_mb: 4096,
        },
        "feature" | "refactor" => ResourceTier {
            timeout_seconds: 1800, // 30 minutes
            cpu_cores: 2.0,
            memory_mb: 4096,
        },
        "greenfield" => ResourceTier {
            timeout_seconds: 3600, // 60 minutes
            cpu_cores: 4.0,
            memory_mb: 8192,
        },
        _ => ResourceTier::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bugfix_tier() {
        let tier = tier_for_category("bugfix");
        assert_eq!(tier.timeout_seconds, 900);
        assert_eq!(tier.timeout(), Duration::from_secs(900));
    }

    #[test]
    fn test_greenfield_tier() {
        let tier = tier_for_category("greenfield");
        assert_eq!(tier.timeout_seconds, 3600);
        assert_eq!(tier.cpu_cores, 4.0);
        assert_eq!(tier.memory_mb, 8192);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(tier_for_category("Feature"), tier_for_category("feature"));
        assert_eq!(tier_for_category("REFACTOR"), tier_for_category("feature"));
    }

    #[test]
    fn test_unknown_defaults() {
        assert_eq!(tier_for_category("mystery"), ResourceTier::default());
    }

    #[test]
    fn test_overrides() {
        let tier = tier_for_category("bugfix")
            .with_timeout_override(Some(60))
            .with_cpu_override(None)
            .with_memory_override(Some(512));
        assert_eq!(tier.timeout_seconds, 60);
        assert_eq!(tier.cpu_cores, 2.0);
        assert_eq!(tier.memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_quota_calculation() {
        assert_eq!(cpu_quota(1.0), 100_000);
        assert_eq!(cpu_quota(0.5), 50_000);
        assert_eq!(cpu_quota(2.0), 200_000);
    }
}
