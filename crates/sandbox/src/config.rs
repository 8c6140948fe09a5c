//! Sandbox configuration.
//!
//! One [`SandboxConfig`] describes one container. All fields are fixed
//! after construction except `communication_port`, which the lifecycle
//! manager rewrites at most once if the configured port turns out to be
//! taken.

use std::path::PathBuf;

/// The fixed port the companion command server listens on *inside* the
/// container. Only the host side of the mapping is dynamic.
pub const INTERNAL_SERVICE_PORT: u16 = 8000;

/// Process name of the companion command server, as it appears in a
/// `ps aux` listing inside the container.
pub const SERVER_PROCESS_NAME: &str = "tcp_server.py";

/// Configuration for one sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker container name. One manager per name; concurrent managers
    /// targeting the same name are not supported.
    pub container_name: String,
    /// Name of the workplace directory, mounted into the container at
    /// `/<workplace_name>`.
    pub workplace_name: String,
    /// Desired host-side TCP port for the command server. May be
    /// rewritten during provisioning if unavailable.
    pub communication_port: u16,
    /// Base image to run.
    pub image: String,
    /// Branch used for the optional bootstrap clone.
    pub branch_name: String,
    /// Task label appended to `branch_name` for the working branch.
    pub task_name: Option<String>,
    /// When set, clone this repository into the workplace before the
    /// container is created.
    pub clone_repo_url: Option<String>,
    /// When set, extract `packages/<name>.tar.gz` into the workplace.
    pub setup_archive: Option<String>,
    /// Local filesystem root the workplace directory lives under.
    pub local_root: PathBuf,
}

impl SandboxConfig {
    /// Host path of the workplace directory.
    pub fn local_workplace(&self) -> PathBuf {
        self.local_root.join(&self.workplace_name)
    }

    /// Mount point of the workplace inside the container.
    pub fn container_workplace(&self) -> String {
        format!("/{}", self.workplace_name)
    }

    /// Name of the working branch for the bootstrap clone:
    /// `<branch_name>_<task_name>`, or just `branch_name` when no task
    /// label is configured.
    pub fn working_branch(&self) -> String {
        match &self.task_name {
            Some(task) => format!("{}_{}", self.branch_name, task),
            None => self.branch_name.clone(),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                   |
    /// |-------------------------|---------------------------|
    /// | `SANDBOX_CONTAINER_NAME`| `sagelab_sandbox`         |
    /// | `SANDBOX_WORKPLACE`     | `workplace`               |
    /// | `SANDBOX_PORT`          | `7020`                    |
    /// | `SANDBOX_IMAGE`         | `sagelab/sandbox:latest`  |
    /// | `SANDBOX_BRANCH`        | `main`                    |
    /// | `SANDBOX_TASK`          | unset                     |
    /// | `SANDBOX_CLONE_URL`     | unset                     |
    /// | `SANDBOX_SETUP_ARCHIVE` | unset                     |
    /// | `SANDBOX_LOCAL_ROOT`    | current working directory |
    pub fn from_env() -> Self {
        let container_name =
            std::env::var("SANDBOX_CONTAINER_NAME").unwrap_or_else(|_| "sagelab_sandbox".into());

        let workplace_name =
            std::env::var("SANDBOX_WORKPLACE").unwrap_or_else(|_| "workplace".into());

        let communication_port: u16 = std::env::var("SANDBOX_PORT")
            .unwrap_or_else(|_| "7020".into())
            .parse()
            .expect("SANDBOX_PORT must be a valid u16");

        let image =
            std::env::var("SANDBOX_IMAGE").unwrap_or_else(|_| "sagelab/sandbox:latest".into());

        let branch_name = std::env::var("SANDBOX_BRANCH").unwrap_or_else(|_| "main".into());

        let local_root = std::env::var("SANDBOX_LOCAL_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().expect("cannot resolve cwd"));

        Self {
            container_name,
            workplace_name,
            communication_port,
            image,
            branch_name,
            task_name: std::env::var("SANDBOX_TASK").ok(),
            clone_repo_url: std::env::var("SANDBOX_CLONE_URL").ok(),
            setup_archive: std::env::var("SANDBOX_SETUP_ARCHIVE").ok(),
            local_root,
        }
    }
}
