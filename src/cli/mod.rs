//! Command-line interface for orch-bench.
//!
//! Provides the `run` and `score` commands over a YAML bench config.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, RunArgs, ScoreArgs};
