//! Sandbox Runner: one container's lifecycle from creation to removal.
//!
//! The runner reports raw facts only (`exit_code`, `timed_out`, `duration`
//! and an output tail). Classifying what an exit code means is the trial
//! orchestrator's job.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::sandbox::engine::{ContainerEngine, ContainerSpec, NetworkSpec};

/// Exit code reported when the deadline expires.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Mount point of the primary workspace inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Hostname under which the host is reachable from inside a sandbox.
pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";

/// Lines of combined output kept in [`RunOutcome::output`].
pub const DEFAULT_OUTPUT_TAIL_LINES: usize = 200;

/// Network policy for a sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network interface at all.
    #[default]
    None,
    /// A dedicated bridge network for this run. Without a gateway the
    /// bridge is internal (no egress); with one, NAT is disabled so only the
    /// host is reachable, through [`HOST_GATEWAY_ALIAS`].
    Isolated { gateway: bool },
    /// The engine's default bridge, with unrestricted egress. Only used for
    /// validation runs that opt into network access.
    Bridge,
}

/// An additional bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path.
    pub host: PathBuf,
    /// Path inside the container.
    pub container: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl Mount {
    /// Creates a read-write mount.
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    /// Creates a read-only mount.
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// Returns the Docker bind string (`host:container[:ro]`).
    pub fn to_bind(&self) -> String {
        let ro = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{}", self.host.display(), self.container, ro)
    }
}

/// Everything needed to run one command in a sandbox.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Image to run.
    pub image: String,
    /// Command to execute.
    pub command: Vec<String>,
    /// Host directory bind-mounted read-write at [`WORKSPACE_MOUNT`].
    pub workspace: PathBuf,
    /// Additional mounts.
    pub mounts: Vec<Mount>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Wall-clock deadline.
    pub timeout: Duration,
    /// CPU budget in cores.
    pub cpu_cores: Option<f64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// Network policy.
    pub network: NetworkPolicy,
    /// User to run as (`uid:gid`).
    pub user: Option<String>,
    /// Lines of output to keep.
    pub output_tail_lines: usize,
}

impl RunOptions {
    /// Creates options with no network, no limits and no extra mounts.
    pub fn new(image: impl Into<String>, workspace: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            image: image.into(),
            command: Vec::new(),
            workspace: workspace.into(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            timeout,
            cpu_cores: None,
            memory_bytes: None,
            network: NetworkPolicy::None,
            user: None,
            output_tail_lines: DEFAULT_OUTPUT_TAIL_LINES,
        }
    }

    /// Sets the command.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Runs a shell snippet with `sh -c`.
    pub fn with_shell(self, script: impl Into<String>) -> Self {
        self.with_command(["sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Adds a mount.
    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds several environment variables.
    pub fn with_envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    /// Sets the CPU budget.
    pub fn with_cpus(mut self, cores: Option<f64>) -> Self {
        self.cpu_cores = cores;
        self
    }

    /// Sets the memory limit.
    pub fn with_memory_bytes(mut self, bytes: Option<i64>) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Sets the network policy.
    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    /// Sets the container user.
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Sets how many trailing output lines are kept.
    pub fn with_output_tail(mut self, lines: usize) -> Self {
        self.output_tail_lines = lines;
        self
    }

    fn validate(&self) -> Result<(), SandboxError> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::InvalidOptions("image is empty".to_string()));
        }
        if self.command.is_empty() {
            return Err(SandboxError::InvalidOptions("command is empty".to_string()));
        }
        if !self.workspace.is_absolute() {
            return Err(SandboxError::InvalidOptions(format!(
                "workspace must be an absolute path: {}",
                self.workspace.display()
            )));
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::InvalidOptions("timeout is zero".to_string()));
        }
        Ok(())
    }

    fn binds(&self) -> Vec<String> {
        let mut binds = vec![Mount::read_write(&self.workspace, WORKSPACE_MOUNT).to_bind()];
        binds.extend(self.mounts.iter().map(Mount::to_bind));
        binds
    }
}

/// Raw result of a sandboxed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Container exit code, or [`TIMEOUT_EXIT_CODE`] on deadline expiry.
    pub exit_code: i64,
    /// Whether the deadline expired.
    pub timed_out: bool,
    /// Wall-clock duration from start to exit or kill.
    pub duration: Duration,
    /// Tail of combined stdout/stderr.
    pub output: String,
}

impl RunOutcome {
    /// True for a clean, non-timed-out exit.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs a command in an isolated sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Runs to completion or timeout. The container is removed before this
    /// returns, on every path.
    async fn run(
        &self,
        opts: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError>;
}

/// [`Sandbox`] implementation over a [`ContainerEngine`].
#[derive(Clone)]
pub struct SandboxRunner {
    engine: Arc<dyn ContainerEngine>,
}

impl SandboxRunner {
    /// Creates a runner over the given engine.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Builds the container spec for a run.
    fn container_spec(&self, name: &str, opts: &RunOptions, network_mode: String) -> ContainerSpec {
        let extra_hosts = match opts.network {
            NetworkPolicy::Isolated { gateway: true } => {
                vec![format!("{HOST_GATEWAY_ALIAS}:host-gateway")]
            }
            _ => Vec::new(),
        };

        ContainerSpec {
            name: name.to_string(),
            image: opts.image.clone(),
            cmd: opts.command.clone(),
            env: opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            binds: opts.binds(),
            user: opts.user.clone(),
            cpu_cores: opts.cpu_cores,
            memory_bytes: opts.memory_bytes,
            network_mode,
            extra_hosts,
        }
    }

    async fn execute(
        &self,
        name: &str,
        opts: &RunOptions,
        guard: &mut CleanupGuard,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError> {
        self.engine.ensure_image(&opts.image).await?;

        let network_mode = match opts.network {
            NetworkPolicy::None => "none".to_string(),
            NetworkPolicy::Bridge => "bridge".to_string(),
            NetworkPolicy::Isolated { gateway } => {
                let spec = NetworkSpec {
                    internal: !gateway,
                    masquerade: !gateway,
                };
                self.engine.create_network(name, spec).await?;
                guard.network = Some(name.to_string());
                name.to_string()
            }
        };

        let spec = self.container_spec(name, opts, network_mode);
        let id = self.engine.create(&spec).await?;
        guard.container = Some(id.clone());

        let start = Instant::now();
        self.engine.start(&id).await?;
        info!(container = %name, image = %opts.image, timeout_secs = opts.timeout.as_secs(), "Container started");

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            res = tokio::time::timeout(opts.timeout, self.engine.wait(&id)) => match res {
                Ok(status) => Waited::Exited(status),
                Err(_) => Waited::TimedOut,
            },
        };

        match waited {
            Waited::Exited(status) => {
                let exit_code = status?;
                let duration = start.elapsed();
                let output = self.tail(&id, opts.output_tail_lines).await;
                debug!(container = %name, exit_code, duration_ms = duration.as_millis() as u64, "Container exited");
                Ok(RunOutcome {
                    exit_code,
                    timed_out: false,
                    duration,
                    output,
                })
            }
            Waited::TimedOut => {
                let duration = start.elapsed();
                warn!(container = %name, timeout_secs = opts.timeout.as_secs(), "Deadline expired, killing container");
                if let Err(e) = self.engine.kill(&id).await {
                    warn!(container = %name, error = %e, "Kill after timeout failed");
                }
                let output = self.tail(&id, opts.output_tail_lines).await;
                Ok(RunOutcome {
                    exit_code: TIMEOUT_EXIT_CODE,
                    timed_out: true,
                    duration,
                    output,
                })
            }
            Waited::Cancelled => {
                warn!(container = %name, "Run cancelled, killing container");
                if let Err(e) = self.engine.kill(&id).await {
                    warn!(container = %name, error = %e, "Kill after cancellation failed");
                }
                Err(SandboxError::Cancelled)
            }
        }
    }

    async fn tail(&self, id: &str, lines: usize) -> String {
        match self.engine.logs_tail(id, lines).await {
            Ok(output) => output,
            Err(e) => {
                debug!(container = %id, error = %e, "Could not read container logs");
                String::new()
            }
        }
    }
}

#[async_trait]
impl Sandbox for SandboxRunner {
    async fn run(
        &self,
        opts: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError> {
        opts.validate()?;

        let name = format!("orchbench-{}", Uuid::new_v4().simple());
        let mut guard = CleanupGuard::new(Arc::clone(&self.engine));

        let result = self.execute(&name, &opts, &mut guard, cancel).await;
        guard.cleanup().await;
        result
    }
}

enum Waited {
    Exited(Result<i64, SandboxError>),
    TimedOut,
    Cancelled,
}

/// Removes the container and network it tracks.
///
/// `cleanup` is awaited on every normal path. If the owning future is
/// dropped first, `Drop` spawns the removal onto the runtime instead.
struct CleanupGuard {
    engine: Arc<dyn ContainerEngine>,
    container: Option<String>,
    network: Option<String>,
}

impl CleanupGuard {
    fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            container: None,
            network: None,
        }
    }

    async fn cleanup(&mut self) {
        if let Some(id) = &self.container {
            if let Err(e) = self.engine.remove(id).await {
                warn!(container = %id, error = %e, "Failed to remove container");
            }
        }
        self.container = None;

        if let Some(name) = &self.network {
            if let Err(e) = self.engine.remove_network(name).await {
                warn!(network = %name, error = %e, "Failed to remove network");
            }
        }
        self.network = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.container.is_none() && self.network.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available to remove sandbox resources");
            return;
        };

        let mut pending = CleanupGuard {
            engine: Arc::clone(&self.engine),
            container: self.container.take(),
            network: self.network.take(),
        };
        handle.spawn(async move {
            pending.cleanup().await;
        });
    }
}
