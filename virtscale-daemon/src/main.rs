//! virtscaled - host daemon for the virtscale control plane.
//!
//! Opens the hypervisor connection, wires the supervisor, adopts existing
//! domains plus the declaratively configured VMs, and runs the closed loop
//! until SIGTERM/SIGINT.

use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use virtscale_core::{DaemonConfig, HypervisorHandle, Supervisor};

mod shutdown;

fn config_path() -> PathBuf {
    std::env::var("VIRTSCALE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| DaemonConfig::default_path())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VIRTSCALE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("virtscaled starting");

    let config_path = config_path();
    let config = DaemonConfig::load(&config_path)?;
    info!(config = %config_path.display(), uri = %config.hypervisor_uri, "Configuration loaded");

    let hypervisor = match HypervisorHandle::connect(&config.hypervisor_uri) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to connect to hypervisor");
            return Err(e.into());
        }
    };
    if let Ok(hostname) = hypervisor.hostname().await {
        let version = hypervisor.version().await.unwrap_or_else(|_| "unknown".to_string());
        info!(hostname = %hostname, version = %version, "Hypervisor connection established");
    }

    let supervisor = Supervisor::new(hypervisor, &config);
    supervisor.bootstrap(&config.vms).await;
    supervisor.start();
    info!("virtscaled ready");

    let mut shutdown = shutdown::shutdown_signal();
    let _ = shutdown.recv().await;

    info!("virtscaled shutting down");
    supervisor.stop().await;

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to rewrite configuration");
    }

    info!("virtscaled stopped");
    Ok(())
}
