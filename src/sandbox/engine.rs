//! Container engine seam and its Docker implementation.
//!
//! [`ContainerEngine`] is the narrow set of primitives the Sandbox Runner
//! needs (create/start/wait/kill/remove plus isolated networks), so the
//! runner can be driven by any engine. [`DockerEngine`] implements it with
//! the bollard crate.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;

use crate::error::SandboxError;
use crate::sandbox::limits::{cpu_quota, CPU_PERIOD_US, DEFAULT_PIDS_LIMIT};

/// Fully resolved description of one container to create.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command (entrypoint arguments).
    pub cmd: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Bind mounts in `host:container[:ro]` form.
    pub binds: Vec<String>,
    /// User to run as (`uid:gid`).
    pub user: Option<String>,
    /// CPU budget in cores.
    pub cpu_cores: Option<f64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// Network mode ("none", or a network name).
    pub network_mode: String,
    /// Extra `/etc/hosts` entries (`name:address`).
    pub extra_hosts: Vec<String>,
}

/// Egress policy of a per-run bridge network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Internal networks have no route outside the bridge.
    pub internal: bool,
    /// When false, NAT is disabled so only the host side of the bridge
    /// is reachable.
    pub masquerade: bool,
}

/// Primitives a container engine must expose to the Sandbox Runner.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Makes sure the image is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Creates a bridge network with the given policy.
    async fn create_network(&self, name: &str, spec: NetworkSpec) -> Result<(), SandboxError>;

    /// Removes a network.
    async fn remove_network(&self, name: &str) -> Result<(), SandboxError>;

    /// Creates a container and returns its ID.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Waits for the container to stop and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    /// Kills the container immediately (SIGKILL, no grace period).
    async fn kill(&self, id: &str) -> Result<(), SandboxError>;

    /// Returns the last `lines` lines of combined stdout/stderr.
    async fn logs_tail(&self, id: &str, lines: usize) -> Result<String, SandboxError>;

    /// Force-removes the container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;
}

/// Docker engine backed by bollard.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Builds the bollard host configuration for a spec.
///
/// Every sandbox drops all capabilities, forbids privilege escalation and
/// gets a pids limit; CPU and memory are applied only when provided.
pub fn host_config(spec: &ContainerSpec) -> HostConfig {
    let (cpu_period, cpu_quota_value) = match spec.cpu_cores {
        Some(cores) if cores > 0.0 => (Some(CPU_PERIOD_US), Some(cpu_quota(cores))),
        _ => (None, None),
    };

    HostConfig {
        binds: if spec.binds.is_empty() {
            None
        } else {
            Some(spec.binds.clone())
        },
        memory: spec.memory_bytes.filter(|m| *m > 0),
        cpu_period,
        cpu_quota: cpu_quota_value,
        pids_limit: Some(DEFAULT_PIDS_LIMIT),
        network_mode: Some(spec.network_mode.clone()),
        extra_hosts: if spec.extra_hosts.is_empty() {
            None
        } else {
            Some(spec.extra_hosts.clone())
        },
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    async fn create_network(&self, name: &str, spec: NetworkSpec) -> Result<(), SandboxError> {
        let mut options = HashMap::new();
        if !spec.masquerade {
            options.insert(
                "com.docker.network.bridge.enable_ip_masquerade",
                "false",
            );
        }

        let request = CreateNetworkOptions {
            name,
            check_duplicate: true,
            driver: "bridge",
            internal: spec.internal,
            options,
            ..Default::default()
        };

        self.docker
            .create_network(request)
            .await
            .map_err(|e| SandboxError::Network {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| SandboxError::Network {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            host_config: Some(host_config(spec)),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::WaitFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
            None => Err(SandboxError::WaitFailed {
                id: id.to_string(),
                reason: "wait stream ended without a status".to_string(),
            }),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| SandboxError::KillFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn logs_tail(&self, id: &str, lines: usize) -> Result<String, SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            tail: lines.to_string(),
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(SandboxError::Logs(e.to_string())),
            }
        }

        Ok(output)
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::RemoveFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }
}
