//! brickemu-node - emulated Tinkerforge Brick Daemon process.

mod config;
mod devices;

use anyhow::{Context, Result};
use brickemu_daemon::BrickDaemon;
use config::NodeConfig;
use devices::DeviceCatalog;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeConfig::from_env()?;
    let manifest = config.manifest()?;
    let daemon_config = config.daemon_config(&manifest);
    info!(
        listen_addr = %daemon_config.listen_addr,
        debug = config.debug,
        manifest = %config
            .manifest_path
            .as_ref()
            .map_or_else(|| "none".to_string(), |path| path.display().to_string()),
        devices = manifest.devices.len(),
        "starting brickemu-node"
    );

    let catalog = DeviceCatalog::new()?;
    let mut daemon = BrickDaemon::new(daemon_config);
    for entry in &manifest.devices {
        catalog
            .add(&mut daemon, entry)
            .await
            .with_context(|| format!("failed to add device {}", entry.uid))?;
    }

    daemon.start().await.context("failed to start daemon")?;

    serve_until(&mut daemon, tokio::signal::ctrl_c()).await
}

/// Serves until `shutdown` resolves, then stops the daemon. A failed shutdown
/// signal still stops the daemon and is returned as the error.
async fn serve_until(
    daemon: &mut BrickDaemon,
    shutdown: impl Future<Output = std::io::Result<()>>,
) -> Result<()> {
    let signal = shutdown.await;

    info!("shutting down");
    daemon.stop().await.context("failed to stop daemon")?;
    signal.context("failed to listen for shutdown signal")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
