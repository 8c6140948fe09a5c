//! Container-tool CLI wrapper.
//!
//! [`ContainerCli`] is the seam between the lifecycle manager and the
//! `docker` binary; [`DockerCli`] is the real implementation, tests
//! substitute stubs. Every operation shells out to a short-lived
//! subprocess with captured output.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Timeout for the best-effort log tail used in timeout diagnostics.
const LOG_TAIL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the container tool.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The tool binary could not be spawned at all.
    #[error("failed to run container tool: {0}")]
    Spawn(#[from] std::io::Error),

    /// The tool exited non-zero; `stderr` carries its diagnostic output.
    #[error("`docker {command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// One host/internal port mapping reported by the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub internal_port: u16,
}

/// Everything needed to create the sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory mounted into the container.
    pub local_workplace: PathBuf,
    /// Mount point and working directory inside the container.
    pub container_workplace: String,
    pub host_port: u16,
    pub internal_port: u16,
}

/// Async interface over the container tool CLI.
///
/// Mirrors the subset of `docker` subcommands the lifecycle manager
/// needs. Implementations must be cheap to call repeatedly; the
/// readiness probe polls several of these every couple of seconds.
#[async_trait]
pub trait ContainerCli: Send + Sync {
    /// Does a container with this exact name exist (running or not)?
    async fn exists(&self, name: &str) -> Result<bool, CliError>;

    /// Is a container with this exact name currently running?
    async fn is_running(&self, name: &str) -> Result<bool, CliError>;

    /// Running-state from `inspect`. `None` while the container cannot
    /// be inspected yet (e.g. creation still in flight).
    async fn inspect_running(&self, name: &str) -> Result<Option<bool>, CliError>;

    async fn start(&self, name: &str) -> Result<(), CliError>;

    async fn stop(&self, name: &str) -> Result<(), CliError>;

    /// Is the image available locally?
    async fn image_present(&self, image: &str) -> Result<bool, CliError>;

    async fn pull_image(&self, image: &str) -> Result<(), CliError>;

    /// Create and start a detached container.
    async fn create(&self, spec: &ContainerSpec) -> Result<(), CliError>;

    /// Names of all currently running containers.
    async fn list_running(&self) -> Result<Vec<String>, CliError>;

    /// First host/internal port mapping of the container, if any.
    ///
    /// This is the single source of truth for the host port: the
    /// originally configured port may have been rewritten during
    /// provisioning.
    async fn port_mappings(&self, name: &str) -> Result<Option<PortMapping>, CliError>;

    /// Last `lines` lines of the container's own log output.
    async fn tail_logs(&self, name: &str, lines: u32) -> Result<String, CliError>;
}

/// [`ContainerCli`] implementation shelling out to the `docker` binary.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output, CliError> {
        tracing::trace!(?args, "Invoking docker");
        let output = Command::new("docker").args(args).output().await?;
        Ok(output)
    }

    /// Run a docker command, mapping non-zero exit to [`CliError::CommandFailed`].
    async fn docker_checked(&self, args: &[&str]) -> Result<String, CliError> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            return Err(CliError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `docker ps` name listing, optionally including stopped containers.
    async fn ps_names(&self, all: bool, name_filter: Option<&str>) -> Result<Vec<String>, CliError> {
        let filter;
        let mut args = vec!["ps"];
        if all {
            args.push("-a");
        }
        if let Some(name) = name_filter {
            filter = format!("name={name}");
            args.push("--filter");
            args.push(&filter);
        }
        args.push("--format");
        args.push("{{.Names}}");

        let stdout = self.docker_checked(&args).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl ContainerCli for DockerCli {
    async fn exists(&self, name: &str) -> Result<bool, CliError> {
        // The name filter is a substring match; compare exact lines.
        let names = self.ps_names(true, Some(name)).await?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn is_running(&self, name: &str) -> Result<bool, CliError> {
        let names = self.ps_names(false, Some(name)).await?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn inspect_running(&self, name: &str) -> Result<Option<bool>, CliError> {
        let output = self
            .docker(&["inspect", "--format", "{{.State.Running}}", name])
            .await?;
        if !output.status.success() {
            // The container may simply not exist yet.
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_lowercase();
        Ok(Some(stdout.contains("true")))
    }

    async fn start(&self, name: &str) -> Result<(), CliError> {
        self.docker_checked(&["start", name]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), CliError> {
        self.docker_checked(&["stop", name]).await?;
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, CliError> {
        let stdout = self.docker_checked(&["images", "-q", image]).await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn pull_image(&self, image: &str) -> Result<(), CliError> {
        self.docker_checked(&["pull", image]).await?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), CliError> {
        let volume = format!(
            "{}:{}",
            spec.local_workplace.display(),
            spec.container_workplace
        );
        let publish = format!("{}:{}", spec.host_port, spec.internal_port);
        self.docker_checked(&[
            "run",
            "-d",
            "--name",
            &spec.name,
            "--user",
            "root",
            "-v",
            &volume,
            "-w",
            &spec.container_workplace,
            "-p",
            &publish,
            "--restart",
            "unless-stopped",
            &spec.image,
        ])
        .await?;
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<String>, CliError> {
        self.ps_names(false, None).await
    }

    async fn port_mappings(&self, name: &str) -> Result<Option<PortMapping>, CliError> {
        let stdout = self.docker_checked(&["port", name]).await?;
        Ok(parse_port_mappings(&stdout))
    }

    async fn tail_logs(&self, name: &str, lines: u32) -> Result<String, CliError> {
        let tail = lines.to_string();
        let args = ["logs", "--tail", &tail, name];
        let fut = self.docker_checked(&args);
        match tokio::time::timeout(LOG_TAIL_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(CliError::CommandFailed {
                command: format!("logs --tail {tail} {name}"),
                stderr: "timed out".into(),
            }),
        }
    }
}

/// Parse `docker port` output into the first usable mapping.
///
/// Lines look like `8000/tcp -> 0.0.0.0:7020` or `8000/tcp -> [::]:7020`.
/// The host port is the final colon-delimited token; lines without a
/// `->` separator or with unparseable ports are skipped.
pub fn parse_port_mappings(output: &str) -> Option<PortMapping> {
    for line in output.lines() {
        let Some((container_part, host_part)) = line.split_once("->") else {
            continue;
        };
        let internal = container_part
            .trim()
            .split('/')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok());
        let host = host_part
            .trim()
            .rsplit(':')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok());
        if let (Some(internal_port), Some(host_port)) = (internal, host) {
            return Some(PortMapping {
                host_port,
                internal_port,
            });
        }
    }
    None
}
