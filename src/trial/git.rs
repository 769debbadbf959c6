//! Git operations behind the [`RepoCloner`] seam.
//!
//! Every command takes its working directory explicitly (`git -C <dir>`);
//! nothing here depends on the process-wide current directory, so
//! concurrent trials never race on it.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::TrialError;

const MAX_REF_LEN: usize = 256;
const MAX_REPO_LEN: usize = 2048;

/// Config overrides applied to every invocation so that a workspace
/// modified by an agent cannot make the harness run its code.
const SAFE_CONFIG: [&str; 4] = [
    "-c",
    "core.fsmonitor=false",
    "-c",
    "core.hooksPath=/dev/null",
];

/// Validates a repository URL or path before it reaches `git clone`.
///
/// Rejects values that `git` could read as an option (leading `-`),
/// whitespace and control characters, and the `ext::` transport, which
/// runs arbitrary commands.
pub fn validate_repo(repo: &str) -> Result<(), TrialError> {
    let invalid = |reason: String| TrialError::InvalidRepo {
        repo: repo.to_string(),
        reason,
    };

    if repo.is_empty() {
        return Err(invalid("repository is empty".to_string()));
    }
    if repo.len() > MAX_REPO_LEN {
        return Err(invalid(format!(
            "too long ({} chars, max {MAX_REPO_LEN})",
            repo.len()
        )));
    }
    if repo.starts_with('-') {
        return Err(invalid(
            "must not start with '-' (could be interpreted as a flag)".to_string(),
        ));
    }
    if repo.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("contains whitespace or control characters".to_string()));
    }
    if repo.to_lowercase().starts_with("ext::") {
        return Err(invalid("the ext:: transport is not allowed".to_string()));
    }
    Ok(())
}

/// Validates a tag against `^[a-zA-Z0-9][a-zA-Z0-9._/-]*$`, additionally
/// rejecting `..` and overlong values.
pub fn validate_tag(tag: &str) -> Result<(), TrialError> {
    let invalid = |reason: String| TrialError::InvalidTag {
        tag: tag.to_string(),
        reason,
    };

    let mut chars = tag.chars();
    match chars.next() {
        None => return Err(invalid("tag is empty".to_string())),
        Some(first) if !first.is_ascii_alphanumeric() => {
            return Err(invalid(format!(
                "must start with an alphanumeric character, found '{first}'"
            )));
        }
        Some(_) => {}
    }
    if tag.len() > MAX_REF_LEN {
        return Err(invalid(format!(
            "too long ({} chars, max {MAX_REF_LEN})",
            tag.len()
        )));
    }
    for ch in chars {
        if !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '/' | '-') {
            return Err(invalid(format!(
                "invalid character '{ch}': only alphanumeric, ., _, /, - allowed"
            )));
        }
    }
    if tag.contains("..") {
        return Err(invalid("must not contain '..'".to_string()));
    }
    Ok(())
}

/// Repository operations the trial orchestrator and scorer need.
#[async_trait]
pub trait RepoCloner: Send + Sync {
    /// Shallow-clones `repo` at `tag` into `dest` and returns the commit
    /// it checked out.
    async fn clone_at(&self, repo: &str, tag: &str, dest: &Path) -> Result<String, TrialError>;

    /// Stages every working-tree change and returns the diff of the index
    /// against `base`. Commits made in the workspace after `base` are part
    /// of the diff.
    async fn stage_and_diff(&self, workspace: &Path, base: &str) -> Result<String, TrialError>;

    /// Writes the tree of revision `rev` into `dest`.
    async fn export_tree(&self, workspace: &Path, rev: &str, dest: &Path)
        -> Result<(), TrialError>;
}

/// [`RepoCloner`] over the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    /// Uses `git` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific git binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs `git -C <dir> <args>` and fails on a non-zero exit.
    async fn run_in(&self, dir: &Path, args: &[&str]) -> Result<Output, TrialError> {
        debug!(dir = %dir.display(), args = ?args, "git");
        let output = Command::new(&self.program)
            .args(SAFE_CONFIG)
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;

        if !output.status.success() {
            return Err(TrialError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                dir: dir.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl RepoCloner for GitCli {
    async fn clone_at(&self, repo: &str, tag: &str, dest: &Path) -> Result<String, TrialError> {
        validate_repo(repo)?;
        validate_tag(tag)?;

        let output = Command::new(&self.program)
            .args(SAFE_CONFIG)
            .args(["clone", "--quiet", "--depth", "1", "--single-branch", "--branch"])
            .arg(tag)
            .arg("--")
            .arg(repo)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;

        if !output.status.success() {
            return Err(TrialError::CloneFailed {
                repo: repo.to_string(),
                tag: tag.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let head = self.run_in(dest, &["rev-parse", "--verify", "HEAD^{commit}"]).await?;
        let base = String::from_utf8_lossy(&head.stdout).trim().to_string();
        debug!(repo, tag, base = %base, "Cloned");
        Ok(base)
    }

    async fn stage_and_diff(&self, workspace: &Path, base: &str) -> Result<String, TrialError> {
        validate_tag(base)?;
        self.run_in(workspace, &["add", "-A"]).await?;
        let output = self
            .run_in(workspace, &["diff", "--cached", "--binary", base, "--"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn export_tree(&self, workspace: &Path, rev: &str, dest: &Path) -> Result<(), TrialError> {
        validate_tag(rev)?;
        let output = self
            .run_in(workspace, &["archive", "--format=tar", rev])
            .await?;

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest)?;
            tar::Archive::new(std::io::Cursor::new(output.stdout)).unpack(&dest)
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
        Ok(())
    }
}
