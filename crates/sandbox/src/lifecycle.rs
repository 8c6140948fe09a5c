//! Sandbox container lifecycle manager.
//!
//! [`SandboxManager`] owns one container's configuration and runtime
//! state and drives it through provisioning:
//!
//! ```text
//! absent  -> creating -> started -> probing -> ready
//! stopped -> starting -> started -> probing -> ready
//! ```
//!
//! Readiness is inherently racy — the companion server's start time
//! inside the sandbox is not synchronized with the host-side probe — so
//! the probe favors optimistic progress: once the container process is
//! confirmably running, exhausting the bounded probe retries declares
//! the sandbox ready rather than failing. Only never observing the
//! running state within the timeout is fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::bootstrap::{self, BootstrapError};
use crate::channel::CommandChannel;
use crate::cli::{CliError, ContainerCli, ContainerSpec, DockerCli};
use crate::config::{SandboxConfig, INTERNAL_SERVICE_PORT, SERVER_PROCESS_NAME};
use crate::ports::{self, PortScanError, DEFAULT_SCAN_ATTEMPTS};

/// Number of container log lines included in timeout diagnostics.
const LOG_TAIL_LINES: u32 = 50;

/// Tunable parameters for the readiness probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Delay between successive polls.
    pub poll_interval: Duration,
    /// Probe attempts against the companion server before giving up
    /// and declaring ready on the strength of the running state alone.
    pub max_probe_retries: u32,
    /// Extra wait granted once when the probe failures look like
    /// transient connection errors.
    pub grace_period: Duration,
    /// Overall deadline for the container to reach the running state.
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_probe_retries: 3,
            grace_period: Duration::from_secs(10),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Errors raised while provisioning or tearing down the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to pull image '{image}': {stderr}")]
    ImagePull { image: String, stderr: String },

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    PortScan(#[from] PortScanError),

    #[error("failed to create container '{container}': {stderr}")]
    Create { container: String, stderr: String },

    #[error(
        "container '{container}' failed to start within {timeout_secs} seconds\n\
         last {log_lines} lines of container logs:\n{logs}"
    )]
    ReadyTimeout {
        container: String,
        timeout_secs: u64,
        log_lines: u32,
        logs: String,
    },

    #[error("failed to stop container '{container}': {stderr}")]
    Stop { container: String, stderr: String },

    /// A container-tool query failed outside the cases above.
    #[error(transparent)]
    Cli(#[from] CliError),
}

/// Owns one sandbox container: creation, readiness, teardown.
///
/// One manager per configured container name. Concurrent managers
/// targeting the same name are not supported.
pub struct SandboxManager {
    config: SandboxConfig,
    cli: Arc<dyn ContainerCli>,
    probe: ProbeConfig,
    /// Actual bound host port; starts at the configured port and is
    /// refreshed from the tool's port mapping once the container runs.
    host_port: u16,
    ready: bool,
}

impl SandboxManager {
    /// Manager backed by the real `docker` CLI.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_cli(config, Arc::new(DockerCli::new()))
    }

    /// Manager with an injected container tool (tests use stubs).
    pub fn with_cli(config: SandboxConfig, cli: Arc<dyn ContainerCli>) -> Self {
        let host_port = config.communication_port;
        Self {
            config,
            cli,
            probe: ProbeConfig::default(),
            host_port,
            ready: false,
        }
    }

    /// Override the readiness probe tunables.
    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The host port the command server is reachable on. Authoritative
    /// only once the readiness probe has run.
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Channel to the sandbox's command server at the current host port.
    pub fn command_channel(&self) -> CommandChannel {
        CommandChannel::new(self.host_port)
    }

    /// Provision the sandbox container and wait for it to become ready.
    ///
    /// Existing running container: nothing to create, the probe only
    /// confirms readiness and discovers the actual port. Existing
    /// stopped container: started, then probed. Otherwise the image is
    /// ensured (pulling if missing), the workplace is bootstrapped, the
    /// host port is resolved, and the container is created.
    pub async fn init(&mut self) -> Result<(), SandboxError> {
        let name = self.config.container_name.clone();

        if self.cli.exists(&name).await? {
            if self.cli.is_running(&name).await? {
                tracing::info!(container = %name, "Container already running, skipping creation");
            } else {
                tracing::info!(container = %name, "Container exists but is stopped, starting it");
                self.cli.start(&name).await?;
            }
            return self.wait_ready().await;
        }

        self.ensure_image().await?;
        bootstrap::prepare_workplace(&self.config).await?;
        self.resolve_port().await?;
        self.create_container().await?;
        self.wait_ready().await
    }

    /// Stop the container. Non-zero exit from the tool is fatal.
    pub async fn stop(&mut self) -> Result<(), SandboxError> {
        let name = self.config.container_name.clone();
        self.cli.stop(&name).await.map_err(|e| match e {
            CliError::CommandFailed { stderr, .. } => SandboxError::Stop {
                container: name.clone(),
                stderr,
            },
            other => SandboxError::Cli(other),
        })?;
        self.ready = false;
        tracing::info!(container = %name, "Container stopped");
        Ok(())
    }

    /// Poll until the container is running and the companion server
    /// responds, per the policy described in the module docs.
    pub async fn wait_ready(&mut self) -> Result<(), SandboxError> {
        let name = self.config.container_name.clone();
        let started = Instant::now();
        let mut probe_retries = 0u32;

        while started.elapsed() < self.probe.timeout {
            let elapsed = started.elapsed().as_secs();

            let running = match self.cli.inspect_running(&name).await {
                Ok(Some(state)) => state,
                Ok(None) | Err(_) => {
                    // Creation may still be in flight.
                    tracing::debug!(container = %name, elapsed, "Container not inspectable yet");
                    tokio::time::sleep(self.probe.poll_interval).await;
                    continue;
                }
            };

            if !running {
                tracing::debug!(container = %name, elapsed, "Container exists but is not running yet");
                tokio::time::sleep(self.probe.poll_interval).await;
                continue;
            }

            // The tool's port mapping is the single source of truth for
            // the host port; the configured one may have been rewritten.
            if let Ok(Some(mapping)) = self.cli.port_mappings(&name).await {
                if mapping.host_port != self.host_port {
                    tracing::info!(
                        container = %name,
                        old_port = self.host_port,
                        new_port = mapping.host_port,
                        "Discovered actual host port mapping",
                    );
                }
                self.host_port = mapping.host_port;
                self.config.communication_port = mapping.host_port;
            }

            match self.probe_server().await {
                Ok(true) => {
                    tracing::info!(container = %name, elapsed, "Sandbox is ready");
                    self.ready = true;
                    return Ok(());
                }
                Ok(false) => {
                    probe_retries += 1;
                    if probe_retries >= self.probe.max_probe_retries {
                        tracing::warn!(
                            container = %name,
                            retries = probe_retries,
                            "Command server not observed, proceeding since container is running",
                        );
                        self.ready = true;
                        return Ok(());
                    }
                    tracing::debug!(
                        container = %name,
                        retries = probe_retries,
                        "Command server not listed yet, retrying",
                    );
                }
                Err(e) => {
                    probe_retries += 1;
                    if probe_retries >= self.probe.max_probe_retries {
                        if is_transient_connection_error(&e) {
                            tracing::warn!(
                                container = %name,
                                error = %e,
                                "Command server connection errors persist, granting grace period",
                            );
                            tokio::time::sleep(self.probe.grace_period).await;
                            if let Ok(true) = self.probe_server().await {
                                tracing::info!(container = %name, "Sandbox is ready");
                                self.ready = true;
                                return Ok(());
                            }
                        }
                        // Running container is the stronger signal.
                        tracing::warn!(
                            container = %name,
                            retries = probe_retries,
                            "Probe retries exhausted, proceeding since container is running",
                        );
                        self.ready = true;
                        return Ok(());
                    }
                    tracing::debug!(
                        container = %name,
                        error = %e,
                        retries = probe_retries,
                        "Command server probe failed, retrying",
                    );
                }
            }

            tokio::time::sleep(self.probe.poll_interval).await;
        }

        let logs = self
            .cli
            .tail_logs(&name, LOG_TAIL_LINES)
            .await
            .unwrap_or_else(|_| "could not retrieve container logs".into());

        Err(SandboxError::ReadyTimeout {
            container: name,
            timeout_secs: self.probe.timeout.as_secs(),
            log_lines: LOG_TAIL_LINES,
            logs,
        })
    }

    // ---- private helpers ----

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        let image = &self.config.image;
        if self.cli.image_present(image).await? {
            return Ok(());
        }
        tracing::info!(image = %image, "Image not present locally, pulling");
        self.cli.pull_image(image).await.map_err(|e| match e {
            CliError::CommandFailed { stderr, .. } => SandboxError::ImagePull {
                image: image.clone(),
                stderr,
            },
            other => SandboxError::Cli(other),
        })
    }

    /// Pre-emptive port conflict resolution: verify the configured port
    /// is bindable and rewrite it (once) if not.
    async fn resolve_port(&mut self) -> Result<(), SandboxError> {
        let port = self.config.communication_port;
        if ports::is_port_available(port) {
            return Ok(());
        }

        let owner = ports::find_container_using_port(self.cli.as_ref(), port).await;
        tracing::warn!(
            port,
            owner = owner.as_deref().unwrap_or("unknown"),
            "Configured port is unavailable, scanning for an alternative",
        );

        self.rewrite_port()?;
        Ok(())
    }

    fn rewrite_port(&mut self) -> Result<(), SandboxError> {
        let old = self.config.communication_port;
        let new = ports::find_available_port(old.saturating_add(1), DEFAULT_SCAN_ATTEMPTS)?;
        tracing::info!(old_port = old, new_port = new, "Switching communication port");
        self.config.communication_port = new;
        self.host_port = new;
        Ok(())
    }

    async fn create_container(&mut self) -> Result<(), SandboxError> {
        match self.cli.create(&self.spec()).await {
            Ok(()) => Ok(()),
            Err(CliError::CommandFailed { stderr, .. }) if is_port_conflict(&stderr) => {
                // Narrow race: the port was free at the pre-check but
                // taken by the time the tool tried to bind it.
                tracing::warn!(
                    port = self.config.communication_port,
                    stderr = %stderr,
                    "Creation hit a port conflict, reallocating and retrying once",
                );
                self.rewrite_port()?;
                self.cli.create(&self.spec()).await.map_err(|e| match e {
                    CliError::CommandFailed { stderr, .. } => SandboxError::Create {
                        container: self.config.container_name.clone(),
                        stderr,
                    },
                    other => SandboxError::Cli(other),
                })
            }
            Err(CliError::CommandFailed { stderr, .. }) => Err(SandboxError::Create {
                container: self.config.container_name.clone(),
                stderr,
            }),
            Err(other) => Err(SandboxError::Cli(other)),
        }
    }

    fn spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.config.container_name.clone(),
            image: self.config.image.clone(),
            local_workplace: self.config.local_workplace(),
            container_workplace: self.config.container_workplace(),
            host_port: self.config.communication_port,
            internal_port: INTERNAL_SERVICE_PORT,
        }
    }

    /// One probe round-trip: list processes inside the sandbox and look
    /// for the companion server.
    async fn probe_server(&self) -> Result<bool, crate::channel::ChannelError> {
        let outcome = self.command_channel().run("ps aux").await?;
        Ok(outcome.result.contains(SERVER_PROCESS_NAME))
    }
}

/// Does this creation failure look like a host-port binding conflict?
fn is_port_conflict(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("port is already allocated") || lower.contains("bind")
}

/// Connection resets and refusals usually mean the companion server has
/// not bound its port yet, not that the sandbox is broken.
fn is_transient_connection_error(err: &crate::channel::ChannelError) -> bool {
    let lower = err.to_string().to_lowercase();
    lower.contains("refused") || lower.contains("reset") || lower.contains("104")
}
