//! Container runtime adapter: the narrow interface spec.md §6 says the core
//! depends on. The default implementation shells out to the `docker` CLI
//! with `tokio::process::Command`, generalizing the teacher's own
//! `launch_server` (which already spawns a child process for the Minecraft
//! server itself) rather than linking a full Docker Engine API client.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Absent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Starting,
    Unhealthy,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
#[error("adapter error: {0}")]
pub struct AdapterError(pub String);

/// The capability set the gateway core depends on. Out-of-scope
/// collaborators (backup, mods, scheduled tasks) use a wider interface that
/// includes `exec`; the core never calls it, so it isn't part of this
/// trait.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn status(&self, container_name: &str) -> Result<ContainerStatus, AdapterError>;
    async fn start(&self, container_name: &str) -> Result<(), AdapterError>;
    async fn stop(&self, container_name: &str, grace_seconds: u32) -> Result<(), AdapterError>;

    /// Optional runtime-level health signal, preferred by the readiness
    /// probe (spec.md §4.4) when available.
    async fn health(&self, _container_name: &str) -> Result<HealthStatus, AdapterError> {
        Ok(HealthStatus::Unknown)
    }
}

/// Default adapter: drives the `docker` CLI directly. No Docker Engine API
/// client dependency is introduced; this mirrors the teacher's own
/// preference for spawning a real process over linking an SDK.
pub struct DockerCliAdapter {
    binary: String,
}

impl DockerCliAdapter {
    pub fn new() -> Self {
        DockerCliAdapter {
            binary: "docker".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, AdapterError> {
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| AdapterError(format!("failed to spawn `{}`: {e}", self.binary)))
    }
}

impl Default for DockerCliAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeAdapter for DockerCliAdapter {
    async fn status(&self, container_name: &str) -> Result<ContainerStatus, AdapterError> {
        let output = self
            .run(&[
                "inspect",
                "--format",
                "{{.State.Running}}",
                container_name,
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such object") || stderr.contains("No such container") {
                return Ok(ContainerStatus::Absent);
            }
            return Ok(ContainerStatus::Unknown);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.trim() {
            "true" => Ok(ContainerStatus::Running),
            "false" => Ok(ContainerStatus::Stopped),
            _ => Ok(ContainerStatus::Unknown),
        }
    }

    async fn start(&self, container_name: &str) -> Result<(), AdapterError> {
        let output = self.run(&["start", container_name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AdapterError(format!(
                "docker start {container_name} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn stop(&self, container_name: &str, grace_seconds: u32) -> Result<(), AdapterError> {
        let grace = grace_seconds.to_string();
        let output = self
            .run(&["stop", "-t", &grace, container_name])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AdapterError(format!(
                "docker stop {container_name} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn health(&self, container_name: &str) -> Result<HealthStatus, AdapterError> {
        let output = self
            .run(&[
                "inspect",
                "--format",
                "{{.State.Health.Status}}",
                container_name,
            ])
            .await?;
        if !output.status.success() {
            return Ok(HealthStatus::Unknown);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(match stdout.trim() {
            "healthy" => HealthStatus::Healthy,
            "starting" => HealthStatus::Starting,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        })
    }
}

/// Readiness probe: poll the adapter's health signal when available,
/// falling back to a raw TCP connect attempt on `internal_port`. Success is
/// the first attempt that reports healthy/connected.
pub async fn probe_readiness(
    adapter: &dyn RuntimeAdapter,
    container_name: &str,
    internal_port: u16,
    overall_timeout: Duration,
    per_attempt_timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + overall_timeout;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        match adapter.health(container_name).await {
            Ok(HealthStatus::Healthy) => return true,
            Ok(HealthStatus::Unhealthy) => {
                // Fall through to the TCP probe; an adapter reporting
                // "unhealthy" on first boot (before the health check has
                // even run once) shouldn't be treated as failure.
            }
            _ => {}
        }

        let addr = format!("127.0.0.1:{internal_port}");
        let connect = tokio::time::timeout(per_attempt_timeout, tokio::net::TcpStream::connect(&addr)).await;
        if matches!(connect, Ok(Ok(_))) {
            return true;
        }

        tokio::time::sleep(poll_interval).await;
    }
}
