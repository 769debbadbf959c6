//! orch-bench: sandboxed benchmark harness for coding-agent orchestrators.
//!
//! Runs each orchestrator against pinned coding tasks inside an isolated
//! container, routes its model-API traffic through a cost-tracking gateway,
//! records the resulting diff and usage, and scores trials on tests, static
//! analysis and an LLM-judged rubric.

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod sandbox;
pub mod scoring;
pub mod trial;

pub use config::BenchConfig;
pub use error::{ConfigError, GatewayError, LlmError, SandboxError, ScoringError, TrialError};
