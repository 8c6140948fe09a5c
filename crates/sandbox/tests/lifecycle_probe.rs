//! Lifecycle manager tests against a scripted container tool stub.
//!
//! The stub records every call and serves canned answers, so these
//! tests exercise the provisioning state machine and the readiness
//! probe without Docker. Where a test needs the command-server probe to
//! succeed, a real TCP stub server plays the companion server.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use sagelab_sandbox::cli::{CliError, ContainerCli, ContainerSpec, PortMapping};
use sagelab_sandbox::config::SandboxConfig;
use sagelab_sandbox::lifecycle::{ProbeConfig, SandboxError, SandboxManager};

#[derive(Default)]
struct StubState {
    exists: bool,
    running: bool,
    /// Scripted `inspect` answers; when empty, falls back to `running`.
    inspect_script: VecDeque<Option<bool>>,
    /// Scripted `create` failures (stderr text); when empty, create succeeds.
    create_failures: VecDeque<String>,
    image_present: bool,
    mapping: Option<PortMapping>,
    logs: String,
    calls: Vec<String>,
    created_specs: Vec<ContainerSpec>,
}

#[derive(Clone, Default)]
struct StubCli {
    state: Arc<Mutex<StubState>>,
}

impl StubCli {
    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl ContainerCli for StubCli {
    async fn exists(&self, _name: &str) -> Result<bool, CliError> {
        let mut s = self.lock();
        s.calls.push("exists".into());
        Ok(s.exists)
    }

    async fn is_running(&self, _name: &str) -> Result<bool, CliError> {
        let mut s = self.lock();
        s.calls.push("is_running".into());
        Ok(s.running)
    }

    async fn inspect_running(&self, _name: &str) -> Result<Option<bool>, CliError> {
        let mut s = self.lock();
        s.calls.push("inspect".into());
        match s.inspect_script.pop_front() {
            Some(answer) => Ok(answer),
            None => Ok(Some(s.running)),
        }
    }

    async fn start(&self, _name: &str) -> Result<(), CliError> {
        let mut s = self.lock();
        s.calls.push("start".into());
        s.running = true;
        Ok(())
    }

    async fn stop(&self, _name: &str) -> Result<(), CliError> {
        let mut s = self.lock();
        s.calls.push("stop".into());
        s.running = false;
        Ok(())
    }

    async fn image_present(&self, _image: &str) -> Result<bool, CliError> {
        let mut s = self.lock();
        s.calls.push("image_present".into());
        Ok(s.image_present)
    }

    async fn pull_image(&self, _image: &str) -> Result<(), CliError> {
        let mut s = self.lock();
        s.calls.push("pull_image".into());
        s.image_present = true;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), CliError> {
        let mut s = self.lock();
        s.calls.push("create".into());
        s.created_specs.push(spec.clone());
        if let Some(stderr) = s.create_failures.pop_front() {
            return Err(CliError::CommandFailed {
                command: "run".into(),
                stderr,
            });
        }
        s.exists = true;
        s.running = true;
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<String>, CliError> {
        Ok(vec![])
    }

    async fn port_mappings(&self, _name: &str) -> Result<Option<PortMapping>, CliError> {
        Ok(self.lock().mapping)
    }

    async fn tail_logs(&self, _name: &str, _lines: u32) -> Result<String, CliError> {
        Ok(self.lock().logs.clone())
    }
}

fn config(tmp: &tempfile::TempDir, port: u16) -> SandboxConfig {
    SandboxConfig {
        container_name: "sagelab_test_sandbox".into(),
        workplace_name: "wp".into(),
        communication_port: port,
        image: "sagelab/sandbox:test".into(),
        branch_name: "main".into(),
        task_name: None,
        clone_repo_url: None,
        setup_archive: None,
        local_root: tmp.path().to_path_buf(),
    }
}

/// Fast probe settings so retry/grace paths finish in milliseconds.
fn fast_probe() -> ProbeConfig {
    ProbeConfig {
        poll_interval: Duration::from_millis(5),
        max_probe_retries: 2,
        grace_period: Duration::from_millis(5),
        timeout: Duration::from_secs(5),
    }
}

/// A free port with nothing listening, so probes get connection refused.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Stub companion server: accepts connections forever and answers every
/// command with a `final` frame whose result includes `tcp_server.py`.
async fn companion_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                let _ = socket.read(&mut buf).await;
                let frame = b"{\"type\":\"final\",\"status\":0,\"result\":\"root 1 python3 /wp/tcp_server.py\"}\n";
                let _ = socket.write_all(frame).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn running_container_skips_creation() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    {
        let mut s = cli.lock();
        s.exists = true;
        s.running = true;
    }
    let server_port = companion_server().await;
    {
        cli.lock().mapping = Some(PortMapping {
            host_port: server_port,
            internal_port: 8000,
        });
    }

    let mut manager =
        SandboxManager::with_cli(config(&tmp, free_port()), Arc::new(cli.clone()))
            .with_probe(fast_probe());
    manager.init().await.unwrap();

    assert!(manager.is_ready());
    assert_eq!(manager.host_port(), server_port);
    assert!(!cli.calls().contains(&"create".to_string()));
    assert!(!cli.calls().contains(&"start".to_string()));
}

#[tokio::test]
async fn stopped_container_is_started_then_probed() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    {
        let mut s = cli.lock();
        s.exists = true;
        s.running = false;
    }
    let server_port = companion_server().await;
    {
        cli.lock().mapping = Some(PortMapping {
            host_port: server_port,
            internal_port: 8000,
        });
    }

    let mut manager =
        SandboxManager::with_cli(config(&tmp, free_port()), Arc::new(cli.clone()))
            .with_probe(fast_probe());
    manager.init().await.unwrap();

    assert!(manager.is_ready());
    let calls = cli.calls();
    assert!(calls.contains(&"start".to_string()));
    assert!(!calls.contains(&"create".to_string()));
}

#[tokio::test]
async fn absent_container_pulls_image_and_creates() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    let server_port = companion_server().await;
    {
        cli.lock().mapping = Some(PortMapping {
            host_port: server_port,
            internal_port: 8000,
        });
    }

    let port = free_port();
    let mut manager =
        SandboxManager::with_cli(config(&tmp, port), Arc::new(cli.clone())).with_probe(fast_probe());
    manager.init().await.unwrap();

    let calls = cli.calls();
    assert!(calls.contains(&"image_present".to_string()));
    assert!(calls.contains(&"pull_image".to_string()));
    assert!(calls.contains(&"create".to_string()));
    // The workplace directory was bootstrapped before creation.
    assert!(tmp.path().join("wp").is_dir());
    // The created spec maps the configured host port to the fixed
    // internal service port.
    let spec = cli.lock().created_specs[0].clone();
    assert_eq!(spec.host_port, port);
    assert_eq!(spec.internal_port, 8000);
}

#[tokio::test]
async fn occupied_port_is_rewritten_before_creation() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    cli.lock().image_present = true;

    // Hold the configured port so the pre-check sees it as taken.
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let mut manager =
        SandboxManager::with_cli(config(&tmp, taken), Arc::new(cli.clone())).with_probe(fast_probe());
    manager.init().await.unwrap();

    let spec = cli.lock().created_specs[0].clone();
    assert!(spec.host_port > taken);
    assert_eq!(manager.host_port(), spec.host_port);
    drop(blocker);
}

#[tokio::test]
async fn port_conflict_during_creation_retries_once() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    {
        let mut s = cli.lock();
        s.image_present = true;
        s.create_failures
            .push_back("Bind for 0.0.0.0 failed: port is already allocated".into());
    }

    let port = free_port();
    let mut manager =
        SandboxManager::with_cli(config(&tmp, port), Arc::new(cli.clone())).with_probe(fast_probe());
    manager.init().await.unwrap();

    let specs = cli.lock().created_specs.clone();
    assert_eq!(specs.len(), 2);
    assert_ne!(specs[0].host_port, specs[1].host_port);
}

#[tokio::test]
async fn non_port_creation_failure_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    {
        let mut s = cli.lock();
        s.image_present = true;
        s.create_failures
            .push_back("no such image: sagelab/sandbox:test".into());
    }

    let mut manager =
        SandboxManager::with_cli(config(&tmp, free_port()), Arc::new(cli.clone()))
            .with_probe(fast_probe());
    let err = manager.init().await.unwrap_err();

    match err {
        SandboxError::Create { stderr, .. } => assert!(stderr.contains("no such image")),
        other => panic!("expected Create error, got {other}"),
    }
}

#[tokio::test]
async fn probe_retries_exhausted_still_declares_ready() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    {
        let mut s = cli.lock();
        s.exists = true;
        s.running = true;
        // No port mapping override; probes hit a dead port and fail
        // with connection refused until retries run out.
    }

    let mut manager =
        SandboxManager::with_cli(config(&tmp, free_port()), Arc::new(cli.clone()))
            .with_probe(fast_probe());
    manager.init().await.unwrap();

    assert!(manager.is_ready());
}

#[tokio::test]
async fn never_running_times_out_with_diagnostics() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    {
        let mut s = cli.lock();
        s.exists = true;
        s.running = false;
        s.logs = "companion server crashed on boot".into();
    }

    let probe = ProbeConfig {
        poll_interval: Duration::from_millis(5),
        max_probe_retries: 2,
        grace_period: Duration::from_millis(5),
        timeout: Duration::from_millis(40),
    };
    let mut manager = SandboxManager::with_cli(config(&tmp, free_port()), Arc::new(cli.clone()))
        .with_probe(probe);

    // Start succeeds but the stub scripts `inspect` to stay false.
    {
        let mut s = cli.lock();
        for _ in 0..100 {
            s.inspect_script.push_back(Some(false));
        }
    }

    let err = manager.init().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("sagelab_test_sandbox"));
    assert!(message.contains("companion server crashed on boot"));
    assert!(!manager.is_ready());
}

#[tokio::test]
async fn stop_resets_readiness() {
    let tmp = tempfile::tempdir().unwrap();
    let cli = StubCli::default();
    {
        let mut s = cli.lock();
        s.exists = true;
        s.running = true;
    }

    let mut manager =
        SandboxManager::with_cli(config(&tmp, free_port()), Arc::new(cli.clone()))
            .with_probe(fast_probe());
    manager.init().await.unwrap();
    assert!(manager.is_ready());

    manager.stop().await.unwrap();
    assert!(!manager.is_ready());
    assert!(cli.calls().contains(&"stop".to_string()));
}
