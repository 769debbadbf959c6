//! On-disk layout of trial artifacts.
//!
//! ```text
//! <results>/<orchestrator>/<task>/trial-<n>/
//!     workspace/      cloned repository, modified by the agent
//!     task.md         task description snapshot
//!     diff.patch      staged diff of the agent's changes
//!     gateway.log     proxy output and usage lines
//!     adapter-out/    free-form adapter output (metrics.json)
//!     meta.json       TrialMeta
//! ```

use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::TrialError;
use crate::trial::types::TrialMeta;

pub const META_FILE: &str = "meta.json";
pub const DIFF_FILE: &str = "diff.patch";
pub const TASK_FILE: &str = "task.md";
pub const GATEWAY_LOG: &str = "gateway.log";
pub const WORKSPACE_DIR: &str = "workspace";
pub const ADAPTER_OUT_DIR: &str = "adapter-out";

/// Paths of one trial's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialDir {
    root: PathBuf,
}

impl TrialDir {
    /// Deterministic directory for `(orchestrator, task, trial)`.
    pub fn new(results_dir: &Path, orchestrator: &str, task: &str, trial: u32) -> Self {
        Self {
            root: results_dir
                .join(sanitize(orchestrator))
                .join(sanitize(task))
                .join(format!("trial-{trial}")),
        }
    }

    /// Wraps an existing trial directory.
    pub fn from_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    pub fn task_file(&self) -> PathBuf {
        self.root.join(TASK_FILE)
    }

    pub fn diff_file(&self) -> PathBuf {
        self.root.join(DIFF_FILE)
    }

    pub fn gateway_log(&self) -> PathBuf {
        self.root.join(GATEWAY_LOG)
    }

    pub fn adapter_out(&self) -> PathBuf {
        self.root.join(ADAPTER_OUT_DIR)
    }

    pub fn meta_file(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    /// Creates the directory for a fresh trial, including an empty
    /// workspace. Fails if the workspace is already present; creating it is
    /// a single `mkdir`, so of two concurrent callers exactly one wins.
    pub fn allocate(&self) -> Result<(), TrialError> {
        std::fs::create_dir_all(&self.root)?;
        match std::fs::create_dir(self.workspace()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(TrialError::TrialDirExists(self.root.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(self.adapter_out())?;
        Ok(())
    }

    /// Writes the record atomically (temp file, then rename).
    pub fn write_meta(&self, meta: &TrialMeta) -> Result<(), TrialError> {
        let json = serde_json::to_string_pretty(meta)?;
        let tmp = self.root.join(format!("{META_FILE}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.meta_file())?;
        Ok(())
    }

    pub fn read_meta(&self) -> Result<TrialMeta, TrialError> {
        let path = self.meta_file();
        if !path.exists() {
            return Err(TrialError::MetaMissing(path));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Reads the diff, empty if absent.
    pub fn read_diff(&self) -> Result<String, TrialError> {
        read_optional(&self.diff_file())
    }

    /// Reads the task snapshot, empty if absent.
    pub fn read_task(&self) -> Result<String, TrialError> {
        read_optional(&self.task_file())
    }
}

fn read_optional(path: &Path) -> Result<String, TrialError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Joins `relative` under `root`, refusing absolute paths and `..`.
pub fn resolve_relative(root: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    let contained = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    contained.then(|| root.join(rel))
}

/// Makes a name safe as a single path component.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Finds every persisted trial under the results directory.
///
/// Only `<orch>/<task>/trial-<n>/meta.json` paths count; files inside
/// workspaces are ignored.
pub fn discover_trials(results_dir: &Path) -> Vec<TrialDir> {
    let mut trials: Vec<TrialDir> = WalkDir::new(results_dir)
        .min_depth(4)
        .max_depth(4)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == META_FILE)
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .filter(|dir| {
            dir.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("trial-"))
        })
        .map(TrialDir::from_path)
        .collect();
    trials.sort_by(|a, b| a.root.cmp(&b.root));
    trials
}
