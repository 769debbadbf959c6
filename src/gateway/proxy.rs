//! Supervision of the cost-tracking reverse proxy subprocess.
//!
//! One [`Gateway`] exists per in-flight trial. `start` picks a free port,
//! spawns the proxy with stdout/stderr appended to a per-instance log, and
//! blocks until the port accepts connections. The same log carries the
//! proxy's usage lines, which [`Gateway::usage_since`] reads back.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::gateway::usage::{log_len, read_usage_since, UsageSummary};

/// Placeholder in gateway args replaced with the chosen port.
pub const PORT_PLACEHOLDER: &str = "{port}";

fn default_startup_retries() -> u32 {
    40
}

fn default_retry_interval_ms() -> u64 {
    250
}

/// How to launch the proxy.
///
/// Sandboxes reach the proxy through the host alias, not loopback, so the
/// proxy must listen on a host-reachable address (for LiteLLM,
/// `--host 0.0.0.0`). Readiness is probed on loopback, which a proxy bound
/// only to `127.0.0.1` also passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments; `{port}` is substituted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment (provider API keys from the secrets file).
    #[serde(default, skip_serializing)]
    pub env: BTreeMap<String, String>,
    /// Fixed port; a free one is picked when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Readiness probes before giving up.
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
    /// Delay between readiness probes in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl GatewayConfig {
    /// Creates a config for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            port: None,
            startup_retries: default_startup_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }

    /// Sets the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds environment variables for the subprocess.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Pins the listening port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the readiness retry policy.
    pub fn with_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.startup_retries = retries;
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    fn resolved_args(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|a| a.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

/// Source of a trial's gateway URL and usage window.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Base URL as seen from the host.
    fn url(&self) -> String;

    /// Marks the start of a usage window.
    fn usage_mark(&self) -> u64;

    /// Summarizes usage recorded since `mark`.
    async fn usage_since(&self, mark: u64) -> Result<UsageSummary, GatewayError>;
}

/// A running proxy subprocess.
pub struct Gateway {
    port: u16,
    log_path: PathBuf,
    child: Option<Child>,
    log: Option<std::fs::File>,
}

impl Gateway {
    /// Launches the proxy and waits until its port accepts connections.
    ///
    /// On any failure the subprocess is stopped before returning.
    pub async fn start(config: &GatewayConfig, log_path: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let log_path = log_path.into();
        let port = match config.port {
            Some(p) => p,
            None => free_port()?,
        };

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let child = Command::new(&config.program)
            .args(config.resolved_args(port))
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GatewayError::Spawn {
                program: config.program.clone(),
                source,
            })?;

        let mut gateway = Self {
            port,
            log_path,
            child: Some(child),
            log: Some(log),
        };

        if let Err(e) = gateway.wait_ready(config).await {
            gateway.stop().await;
            return Err(e);
        }

        info!(port, log = %gateway.log_path.display(), "Gateway ready");
        Ok(gateway)
    }

    async fn wait_ready(&mut self, config: &GatewayConfig) -> Result<(), GatewayError> {
        for attempt in 1..=config.startup_retries {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(GatewayError::ExitedEarly {
                        status: status.to_string(),
                        log: self.log_path.clone(),
                    });
                }
            }

            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                return Ok(());
            }

            debug!(port = self.port, attempt, "Gateway not ready yet");
            tokio::time::sleep(config.retry_interval()).await;
        }

        Err(GatewayError::NotReady {
            port: self.port,
            attempts: config.startup_retries,
            log: self.log_path.clone(),
        })
    }

    /// Terminates the subprocess and closes the log. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Gateway already exited");
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "Failed to reap gateway process");
            }
        }
        self.log = None;
    }

    /// Local base URL.
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Whether the subprocess is still owned.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

#[async_trait]
impl UsageSource for Gateway {
    fn url(&self) -> String {
        Gateway::url(self)
    }

    fn usage_mark(&self) -> u64 {
        log_len(&self.log_path)
    }

    async fn usage_since(&self, mark: u64) -> Result<UsageSummary, GatewayError> {
        let records = read_usage_since(&self.log_path, mark)?;
        Ok(UsageSummary::from_records(&records))
    }
}

/// Asks the OS for a TCP port free on every interface, since the proxy
/// listens on a host-reachable address.
pub fn free_port() -> Result<u16, GatewayError> {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").map_err(GatewayError::NoFreePort)?;
    let port = listener
        .local_addr()
        .map_err(GatewayError::NoFreePort)?
        .port();
    Ok(port)
}

/// Replaces the host of `url`, keeping scheme, port and path.
///
/// Used to turn `http://localhost:PORT` into a URL the sandbox can reach.
pub fn rewrite_host(url: &str, host: &str) -> Result<String, GatewayError> {
    let invalid = |reason: String| GatewayError::InvalidUrl {
        url: url.to_string(),
        reason,
    };

    let mut parsed = reqwest::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    parsed
        .set_host(Some(host))
        .map_err(|e| invalid(e.to_string()))?;

    let rewritten = parsed.to_string();
    if !url.ends_with('/') && rewritten.ends_with('/') && parsed.path() == "/" {
        return Ok(rewritten.trim_end_matches('/').to_string());
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_host() {
        assert_eq!(
            rewrite_host("http://localhost:4000", "host.docker.internal").unwrap(),
            "http://host.docker.internal:4000"
        );
        assert_eq!(
            rewrite_host("http://127.0.0.1:4000/v1", "host.docker.internal").unwrap(),
            "http://host.docker.internal:4000/v1"
        );
        assert!(rewrite_host("not a url", "x").is_err());
    }

    #[test]
    fn test_port_placeholder() {
        let config = GatewayConfig::new("litellm").with_args(["--port", "{port}", "--log={port}.log"]);
        assert_eq!(config.resolved_args(4123), vec!["--port", "4123", "--log=4123.log"]);
    }

    #[test]
    fn test_config_defaults_from_yaml() {
        let config: GatewayConfig = serde_yaml::from_str("program: litellm\n").unwrap();
        assert_eq!(config.startup_retries, 40);
        assert_eq!(config.retry_interval_ms, 250);
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_free_port_is_free_on_all_interfaces() {
        let port = free_port().unwrap();
        assert!(port > 0);
        assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
    }

    #[tokio::test]
    async fn test_start_ready_and_stop() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();

        let config = GatewayConfig::new("sleep")
            .with_args(["5"])
            .with_port(port)
            .with_retries(5, Duration::from_millis(20));
        let mut gateway = Gateway::start(&config, dir.path().join("gateway.log"))
            .await
            .unwrap();

        assert_eq!(gateway.url(), format!("http://localhost:{port}"));
        assert!(gateway.is_running());
        assert_eq!(gateway.usage_mark(), 0);

        gateway.stop().await;
        assert!(!gateway.is_running());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_usage_window() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("gateway.log");

        let config = GatewayConfig::new("sleep").with_args(["5"]).with_port(port);
        let mut gateway = Gateway::start(&config, &log_path).await.unwrap();

        std::fs::write(&log_path, "{\"provider\":\"a\",\"model\":\"haiku\",\"input_tokens\":10}\n").unwrap();
        let mark = gateway.usage_mark();
        let mut content = std::fs::read_to_string(&log_path).unwrap();
        content.push_str("{\"provider\":\"a\",\"model\":\"haiku\",\"input_tokens\":7,\"output_tokens\":3}\n");
        std::fs::write(&log_path, content).unwrap();

        let summary = gateway.usage_since(mark).await.unwrap();
        assert_eq!(summary.calls, 1);
        assert_eq!(summary.total_tokens(), 10);

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_early_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::new("sh")
            .with_args(["-c", "exit 1"])
            .with_retries(50, Duration::from_millis(20));

        let result = Gateway::start(&config, dir.path().join("gateway.log")).await;
        assert!(matches!(result, Err(GatewayError::ExitedEarly { .. })));
    }

    #[tokio::test]
    async fn test_not_ready_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::new("sleep")
            .with_args(["5"])
            .with_retries(3, Duration::from_millis(10));

        let result = Gateway::start(&config, dir.path().join("gateway.log")).await;
        assert!(matches!(result, Err(GatewayError::NotReady { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::new("/nonexistent/proxy-binary");

        let result = Gateway::start(&config, dir.path().join("gateway.log")).await;
        assert!(matches!(result, Err(GatewayError::Spawn { .. })));
    }
}
