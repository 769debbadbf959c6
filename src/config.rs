//! Bench configuration loaded from YAML.
//!
//! ```yaml
//! trials: 3
//! concurrency: 4
//! results_dir: results
//! secrets_file: secrets.env
//! budget_usd: 2.5
//! gateway:
//!   program: litellm
//!   args: ["--port", "{port}", "--host", "0.0.0.0"]
//! orchestrators:
//!   - name: aider
//!     adapter: adapters/aider.sh
//!     image: orchbench/aider:latest
//! tasks:
//!   - name: fix-parser
//!     repo: https://github.com/acme/parser.git
//!     tag: bench-v1
//!     validation_image: python:3.11
//!     test_cmd: pytest -q
//! ```
//!
//! Relative paths are resolved against the config file's directory.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::gateway::GatewayConfig;
use crate::trial::git::{validate_repo, validate_tag};
use crate::trial::store::sanitize;
use crate::trial::types::{Orchestrator, Task};

fn default_trials() -> u32 {
    1
}

fn default_concurrency() -> usize {
    1
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Top-level bench configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    pub orchestrators: Vec<Orchestrator>,
    pub tasks: Vec<Task>,
    /// Trials per (orchestrator, task).
    #[serde(default = "default_trials")]
    pub trials: u32,
    /// Trials in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Domains the operator intends agents to reach. Logged only: sandbox
    /// egress is denied except for the gateway.
    #[serde(default)]
    pub network_allowlist: Vec<String>,
    /// `KEY=VALUE` file passed to the gateway subprocess only.
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
    /// Per-trial cost ceiling.
    #[serde(default)]
    pub budget_usd: Option<f64>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    /// Model for the rubric judge; the client default when unset.
    #[serde(default)]
    pub judge_model: Option<String>,
}

impl BenchConfig {
    /// Reads, resolves and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_yaml(&content, base)?;
        info!(
            path = %path.display(),
            orchestrators = config.orchestrators.len(),
            tasks = config.tasks.len(),
            trials = config.trials,
            "Loaded bench config"
        );
        Ok(config)
    }

    /// Parses YAML, resolving relative paths against `base`, and validates.
    pub fn from_yaml(content: &str, base: &Path) -> Result<Self, ConfigError> {
        let mut config: BenchConfig = serde_yaml::from_str(content)?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        for orchestrator in &mut self.orchestrators {
            orchestrator.adapter = resolve(&orchestrator.adapter);
        }
        self.results_dir = resolve(&self.results_dir);
        self.secrets_file = self.secrets_file.as_deref().map(resolve);
    }

    /// Checks names, images, adapters, weights and greenfield settings.
    ///
    /// Names are compared in their on-disk form, so two names that map to
    /// the same trial directory are duplicates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trials == 0 {
            return Err(invalid("setting", "trials", "must be at least 1"));
        }
        if let Some(budget) = self.budget_usd {
            if !budget.is_finite() || budget < 0.0 {
                return Err(invalid("setting", "budget_usd", "must be a non-negative number"));
            }
        }

        let mut names = HashSet::new();
        for o in &self.orchestrators {
            if !names.insert(sanitize(&o.name)) {
                return Err(ConfigError::Duplicate {
                    kind: "orchestrator",
                    name: o.name.clone(),
                });
            }
            if o.name.trim().is_empty() {
                return Err(invalid("orchestrator", &o.name, "name is empty"));
            }
            if o.image.trim().is_empty() {
                return Err(invalid("orchestrator", &o.name, "image is empty"));
            }
            if !o.adapter.is_file() {
                return Err(invalid(
                    "orchestrator",
                    &o.name,
                    &format!("adapter {} not found", o.adapter.display()),
                ));
            }
        }

        let mut names = HashSet::new();
        for t in &self.tasks {
            if !names.insert(sanitize(&t.name)) {
                return Err(ConfigError::Duplicate {
                    kind: "task",
                    name: t.name.clone(),
                });
            }
            validate_task(t)?;
        }
        Ok(())
    }

    /// Logs the egress allowlist and the policy actually applied.
    pub fn log_network_policy(&self) {
        if self.network_allowlist.is_empty() {
            info!("Sandbox egress: deny all, gateway reachable via host alias");
        } else {
            info!(
                allowlist = ?self.network_allowlist,
                "Sandbox egress: deny all, allowlist recorded but not enforced per domain"
            );
        }
    }

    /// The gateway config with secrets from `secrets_file` in its env.
    pub fn gateway_with_secrets(&self) -> Result<Option<GatewayConfig>, ConfigError> {
        let Some(gateway) = self.gateway.clone() else {
            return Ok(None);
        };
        let secrets = match &self.secrets_file {
            Some(path) => load_secrets(path)?,
            None => BTreeMap::new(),
        };
        Ok(Some(gateway.with_env(secrets)))
    }

}

fn invalid(kind: &'static str, name: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_task(t: &Task) -> Result<(), ConfigError> {
    if t.name.trim().is_empty() {
        return Err(invalid("task", &t.name, "name is empty"));
    }
    if t.validation_image.trim().is_empty() {
        return Err(invalid("task", &t.name, "validation_image is empty"));
    }
    validate_repo(&t.repo).map_err(|e| invalid("task", &t.name, &e.to_string()))?;
    validate_tag(&t.tag).map_err(|e| invalid("task", &t.name, &e.to_string()))?;

    if t.timeout_secs == Some(0) {
        return Err(invalid("task", &t.name, "timeout_secs must be positive"));
    }
    if t.validation_timeout_secs == 0 {
        return Err(invalid("task", &t.name, "validation_timeout_secs must be positive"));
    }
    if let Some(cpus) = t.cpus.filter(|c| !c.is_finite() || *c <= 0.0) {
        return Err(invalid("task", &t.name, &format!("cpus is {cpus}, must be positive")));
    }
    if t.memory_mb == Some(0) {
        return Err(invalid("task", &t.name, "memory_mb must be positive"));
    }

    if let Some((axis, w)) = t.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        return Err(invalid(
            "task",
            &t.name,
            &format!("weight for {axis} is {w}, must be non-negative"),
        ));
    }
    if let Some(c) = t.rubric.iter().find(|c| !c.weight.is_finite() || c.weight < 0.0) {
        return Err(invalid(
            "task",
            &t.name,
            &format!("rubric criterion '{}' has negative weight", c.name),
        ));
    }

    if t.greenfield {
        let tag = t
            .validation_tag
            .as_deref()
            .ok_or_else(|| invalid("task", &t.name, "greenfield tasks need a validation_tag"))?;
        validate_tag(tag).map_err(|e| invalid("task", &t.name, &e.to_string()))?;
    }
    Ok(())
}

/// Reads a `KEY=VALUE` secrets file.
///
/// Blank lines and `#` comments are skipped; an `export ` prefix and
/// matching surrounding quotes on the value are stripped.
pub fn load_secrets(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_secrets(&content)
}

pub fn parse_secrets(content: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut secrets = BTreeMap::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line
            .split_once('=')
            .ok_or(ConfigError::Secrets { line: idx + 1 })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::Secrets { line: idx + 1 });
        }
        let value = value.trim();
        let value = ['"', '\'']
            .iter()
            .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
            .unwrap_or(value);
        secrets.insert(key.to_string(), value.to_string());
    }
    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::types::ScoreAxis;

    fn write_adapter(dir: &Path) {
        std::fs::create_dir_all(dir.join("adapters")).unwrap();
        std::fs::write(dir.join("adapters/a.sh"), "#!/bin/sh\n").unwrap();
    }

    const BASIC: &str = r#"
orchestrators:
  - name: alpha
    adapter: adapters/a.sh
    image: alpha:latest
    env:
      MODE: fast
tasks:
  - name: fix-parser
    repo: https://github.com/acme/parser.git
    tag: bench-v1
    category: bugfix
    validation_image: python:3.11
    test_cmd: pytest -q
    weights:
      tests: 0.5
      static_analysis: 0.2
      rubric: 0.3
"#;

    #[test]
    fn test_load_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());

        let config = BenchConfig::from_yaml(BASIC, tmp.path()).unwrap();

        assert_eq!(config.trials, 1);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.results_dir, tmp.path().join("results"));
        assert_eq!(config.orchestrators[0].adapter, tmp.path().join("adapters/a.sh"));
        assert_eq!(config.orchestrators[0].env["MODE"], "fast");
        assert_eq!(config.tasks[0].weights[&ScoreAxis::Tests], 0.5);
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_missing_adapter_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = BenchConfig::from_yaml(BASIC, tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { kind: "orchestrator", .. }));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());
        let yaml = format!(
            "{BASIC}  - name: fix-parser\n    repo: https://x/r.git\n    tag: v1\n    validation_image: img\n"
        );
        let err = BenchConfig::from_yaml(&yaml, tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { kind: "task", .. }));
    }

    #[test]
    fn test_names_colliding_on_disk_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());
        let yaml = BASIC.replace(
            "  - name: alpha\n",
            "  - name: my agent\n    adapter: adapters/a.sh\n    image: a:latest\n  - name: my_agent\n",
        );
        let err = BenchConfig::from_yaml(&yaml, tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Duplicate { kind: "orchestrator", ref name } if name == "my_agent"
        ));

        let yaml = format!(
            "{BASIC}  - name: fix lexer\n    repo: https://x/r.git\n    tag: v1\n    validation_image: img\n  - name: fix_lexer\n    repo: https://x/r.git\n    tag: v1\n    validation_image: img\n"
        );
        let err = BenchConfig::from_yaml(&yaml, tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { kind: "task", .. }));
    }

    #[test]
    fn test_non_positive_limits_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());
        for limit in [
            "timeout_secs: 0",
            "validation_timeout_secs: 0",
            "cpus: -1.0",
            "cpus: 0",
            "memory_mb: 0",
        ] {
            let yaml = BASIC.replace("test_cmd: pytest -q", &format!("test_cmd: pytest -q\n    {limit}"));
            let err = BenchConfig::from_yaml(&yaml, tmp.path()).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { kind: "task", .. }),
                "{limit} accepted"
            );
        }

        let yaml = BASIC.replace("test_cmd: pytest -q", "test_cmd: pytest -q\n    cpus: 0.5");
        assert!(BenchConfig::from_yaml(&yaml, tmp.path()).is_ok());
    }

    #[test]
    fn test_option_like_repo_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());
        let yaml = BASIC.replace("https://github.com/acme/parser.git", "--upload-pack=evil");
        assert!(BenchConfig::from_yaml(&yaml, tmp.path()).is_err());
    }

    #[test]
    fn test_greenfield_requires_validation_tag() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());
        let yaml = BASIC.replace("category: bugfix", "category: greenfield\n    greenfield: true");
        let err = BenchConfig::from_yaml(&yaml, tmp.path()).unwrap_err();
        assert!(err.to_string().contains("validation_tag"));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());
        let yaml = BASIC.replace("rubric: 0.3", "rubric: -0.3");
        assert!(BenchConfig::from_yaml(&yaml, tmp.path()).is_err());
    }

    #[test]
    fn test_parse_secrets() {
        let secrets = parse_secrets(
            "# provider keys\n\nANTHROPIC_API_KEY=sk-ant\nexport OPENAI_API_KEY=\"sk-oa\"\nEMPTY=\n",
        )
        .unwrap();
        assert_eq!(secrets["ANTHROPIC_API_KEY"], "sk-ant");
        assert_eq!(secrets["OPENAI_API_KEY"], "sk-oa");
        assert_eq!(secrets["EMPTY"], "");

        let err = parse_secrets("GOOD=1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, ConfigError::Secrets { line: 2 }));
    }

    #[test]
    fn test_gateway_with_secrets() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path());
        std::fs::write(tmp.path().join("secrets.env"), "KEY=value\n").unwrap();
        let yaml = format!("{BASIC}secrets_file: secrets.env\ngateway:\n  program: litellm\n");

        let config = BenchConfig::from_yaml(&yaml, tmp.path()).unwrap();
        let gateway = config.gateway_with_secrets().unwrap().unwrap();

        assert_eq!(gateway.program, "litellm");
        assert_eq!(gateway.env["KEY"], "value");
    }
}
