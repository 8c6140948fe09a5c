use sagelab_sandbox::config::SandboxConfig;
use sagelab_sandbox::lifecycle::SandboxManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sagelab_sandboxd=debug,sagelab_sandbox=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SandboxConfig::from_env();
    tracing::info!(
        container = %config.container_name,
        image = %config.image,
        port = config.communication_port,
        "Sandbox daemon starting"
    );

    let mut manager = SandboxManager::new(config);
    if let Err(e) = manager.init().await {
        tracing::error!(error = %e, "Sandbox provisioning failed");
        std::process::exit(1);
    }
    tracing::info!(
        host_port = manager.host_port(),
        "Sandbox is ready, command server reachable"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down, stopping sandbox container");
    if let Err(e) = manager.stop().await {
        tracing::error!(error = %e, "Failed to stop sandbox container");
        std::process::exit(1);
    }
}
