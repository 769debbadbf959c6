//! Sandbox Runner: isolated, resource-limited container runs.
//!
//! - [`engine`]: the [`ContainerEngine`] seam and its bollard-backed [`DockerEngine`]
//! - [`limits`]: category-based resource tiers
//! - [`runner`]: [`SandboxRunner`], which owns one container's lifecycle per run

pub mod engine;
pub mod limits;
pub mod runner;

pub use engine::{ContainerEngine, ContainerSpec, DockerEngine, NetworkSpec};
pub use limits::{tier_for_category, ResourceTier};
pub use runner::{
    Mount, NetworkPolicy, RunOptions, RunOutcome, Sandbox, SandboxRunner, HOST_GATEWAY_ALIAS,
    TIMEOUT_EXIT_CODE, WORKSPACE_MOUNT,
};
