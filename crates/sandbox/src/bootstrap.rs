//! Workplace bootstrap: directory, setup archive, optional clone.
//!
//! Runs on the host before the container is created. The workplace
//! directory is what gets volume-mounted into the sandbox, so it must
//! contain the companion server script (from the setup archive) and,
//! for experiment tasks, a checkout of the task repository on its own
//! working branch.

use std::path::Path;

use tokio::process::Command;

use crate::config::{SandboxConfig, SERVER_PROCESS_NAME};

/// Errors during workplace preparation.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to create workplace directory: {0}")]
    Workplace(#[source] std::io::Error),

    #[error("failed to run bootstrap command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to clone repository {url}: {stderr}")]
    Clone { url: String, stderr: String },

    #[error("failed to switch to branch {branch}: {stderr}")]
    Branch { branch: String, stderr: String },
}

/// Prepare the local workplace directory for mounting.
///
/// 1. Create the directory if missing.
/// 2. Extract the setup archive unless the companion server script is
///    already in place (extraction failure is logged, not fatal — a
///    pre-populated workplace is acceptable).
/// 3. Clone the configured repository if absent (fatal on failure),
///    then create the working branch; if the branch already exists,
///    fall back to checking it out, and fail only if that also fails.
pub async fn prepare_workplace(config: &SandboxConfig) -> Result<(), BootstrapError> {
    let workplace = config.local_workplace();
    tokio::fs::create_dir_all(&workplace)
        .await
        .map_err(BootstrapError::Workplace)?;

    if let Some(archive) = &config.setup_archive {
        extract_setup_archive(&workplace, archive).await?;
    }

    if let Some(url) = &config.clone_repo_url {
        clone_and_branch(config, &workplace, url).await?;
    }

    Ok(())
}

async fn extract_setup_archive(workplace: &Path, archive: &str) -> Result<(), BootstrapError> {
    if workplace.join(SERVER_PROCESS_NAME).exists() {
        tracing::debug!(archive, "Setup archive already extracted, skipping");
        return Ok(());
    }

    let archive_path = format!("packages/{archive}.tar.gz");
    let output = Command::new("tar")
        .args(["-xzf", &archive_path, "-C"])
        .arg(workplace)
        .output()
        .await?;

    if !output.status.success() {
        tracing::warn!(
            archive = %archive_path,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Setup archive extraction failed, continuing with existing workplace",
        );
    }
    Ok(())
}

async fn clone_and_branch(
    config: &SandboxConfig,
    workplace: &Path,
    url: &str,
) -> Result<(), BootstrapError> {
    let repo_dir = workplace.join(repo_dir_name(url));

    if !repo_dir.exists() {
        let output = Command::new("git")
            .args(["clone", "-b", &config.branch_name, url])
            .arg(&repo_dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(BootstrapError::Clone {
                url: url.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!(url, branch = %config.branch_name, "Cloned task repository");
    }

    let branch = config.working_branch();
    let create = Command::new("git")
        .args(["checkout", "-b", &branch])
        .current_dir(&repo_dir)
        .output()
        .await?;
    if create.status.success() {
        tracing::info!(branch = %branch, "Created working branch");
        return Ok(());
    }

    // The branch probably exists from a previous run; switch to it.
    let switch = Command::new("git")
        .args(["checkout", &branch])
        .current_dir(&repo_dir)
        .output()
        .await?;
    if !switch.status.success() {
        return Err(BootstrapError::Branch {
            branch,
            stderr: String::from_utf8_lossy(&switch.stderr).trim().to_string(),
        });
    }
    tracing::info!(branch = %branch, "Switched to existing working branch");
    Ok(())
}

/// Directory name for a clone of `url` (last path segment, `.git` stripped).
fn repo_dir_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git")
        .to_string()
}
