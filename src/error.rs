//! Error types for orch-bench operations.
//!
//! One enum per subsystem:
//! - Sandbox Runner (container lifecycle)
//! - Cost-Tracking Gateway (proxy supervision)
//! - Trial Orchestrator (clone, run, persist)
//! - Composite Scoring Pipeline
//! - Bench configuration loading
//! - LLM API interactions (rubric judge)
//!
//! Execution outcomes (timeout, crash, give-up) are not errors; they are
//! recorded as [`crate::trial::ExitReason`] values.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while running a sandboxed container.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    #[error("Error waiting for container '{id}': {reason}")]
    WaitFailed { id: String, reason: String },

    #[error("Failed to kill container '{id}': {reason}")]
    KillFailed { id: String, reason: String },

    #[error("Failed to remove container '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },

    #[error("Network operation failed for '{name}': {reason}")]
    Network { name: String, reason: String },

    #[error("Failed to read container logs: {0}")]
    Logs(String),

    #[error("Invalid run options: {0}")]
    InvalidOptions(String),

    #[error("Sandbox run cancelled")]
    Cancelled,
}

/// Errors that can occur while supervising the cost-tracking proxy.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No free port available: {0}")]
    NoFreePort(std::io::Error),

    #[error("Failed to spawn gateway '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gateway exited during startup ({status}); see {log}")]
    ExitedEarly { status: String, log: PathBuf },

    #[error("Gateway on port {port} not reachable after {attempts} attempts; see {log}")]
    NotReady {
        port: u16,
        attempts: u32,
        log: PathBuf,
    },

    #[error("Invalid gateway URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hard-stop errors for a single trial. No trial record is written when
/// one of these is returned.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("Invalid repository '{repo}': {reason}")]
    InvalidRepo { repo: String, reason: String },

    #[error("Invalid tag '{tag}': {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("Clone of {repo}@{tag} failed: {stderr}")]
    CloneFailed {
        repo: String,
        tag: String,
        stderr: String,
    },

    #[error("git {command} failed in {dir}: {stderr}")]
    Git {
        command: String,
        dir: PathBuf,
        stderr: String,
    },

    #[error("Trial directory already holds a workspace: {0}")]
    TrialDirExists(PathBuf),

    #[error("Adapter not found at {0}")]
    AdapterMissing(PathBuf),

    #[error("Trial metadata not found at {0}")]
    MetaMissing(PathBuf),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by a single scoring axis. These are recovered locally:
/// the axis is recorded as missing, never as zero.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Checkout failed: {0}")]
    Checkout(String),

    #[error("Judge call failed: {0}")]
    Judge(#[from] LlmError),

    #[error("Unparseable judge verdict: {0}")]
    Verdict(String),

    #[error("Invalid lint issue pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Command produced no score: {0}")]
    NoScore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading the bench configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Duplicate {kind} name '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("Invalid {kind} '{name}': {reason}")]
    Invalid {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Malformed secrets file line {line}: expected KEY=VALUE")]
    Secrets { line: usize },
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}
