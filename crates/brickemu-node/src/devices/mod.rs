//! Bundled device emulations.

pub mod ambient_light_v3;
pub mod proxy;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use brickemu_core::Uid;
use brickemu_daemon::{BrickDaemon, Device, DeviceConfig, FunctionTable, UpstreamTarget};
use tracing::info;

use crate::config::{DeviceEntry, DeviceKind};
use ambient_light_v3::AmbientLightV3;

/// Function tables of every bundled device type, built once and shared by
/// all instances.
#[derive(Debug)]
pub struct DeviceCatalog {
    ambient_light_v3: Arc<FunctionTable<AmbientLightV3>>,
    proxy: Arc<FunctionTable<()>>,
}

impl DeviceCatalog {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ambient_light_v3: Arc::new(
                ambient_light_v3::table().context("failed to build ambient light table")?,
            ),
            proxy: Arc::new(proxy::table().context("failed to build proxy table")?),
        })
    }

    /// Creates the device described by `entry` and adds it to `daemon`.
    pub async fn add(&self, daemon: &mut BrickDaemon, entry: &DeviceEntry) -> Result<()> {
        let config = device_config(entry)?;

        match entry.kind {
            DeviceKind::AmbientLightV3 => {
                let config = config.with_identity(entry.identity(ambient_light_v3::DEVICE_IDENTIFIER)?);
                let device = Device::new(config, Arc::clone(&self.ambient_light_v3), AmbientLightV3::default())?;
                daemon.add_device(device).await?;
            },
            DeviceKind::Proxy => {
                if config.upstream.is_none() {
                    bail!("proxy device {} needs an upstream", entry.uid);
                }
                let device = Device::new(config, Arc::clone(&self.proxy), ())?;
                daemon.add_device(device).await?;
            },
        }

        info!(uid = %entry.uid, kind = %entry.kind, "Device added");
        Ok(())
    }
}

fn device_config(entry: &DeviceEntry) -> Result<DeviceConfig> {
    let uid = Uid::parse(&entry.uid).with_context(|| format!("invalid UID {:?}", entry.uid))?;

    let mut config = DeviceConfig::new(uid).with_passthrough_policy(entry.passthrough_policy());
    if let Some(debug) = entry.debug {
        config = config.with_debug(debug);
    }
    if let Some(upstream) = &entry.upstream {
        config = config.with_upstream(UpstreamTarget::new(&upstream.host, upstream.port));
        if let Some(interval) = upstream.retry_interval() {
            config = config.with_retry_interval(interval);
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use brickemu_daemon::{DaemonConfig, DaemonError};

    use super::*;
    use crate::config::UpstreamEntry;

    #[tokio::test]
    async fn test_add_manifest_devices() {
        let catalog = DeviceCatalog::new().unwrap();
        let mut daemon = BrickDaemon::new(DaemonConfig::new("127.0.0.1:0"));

        catalog
            .add(&mut daemon, &DeviceEntry::new(DeviceKind::AmbientLightV3, "EALV3"))
            .await
            .unwrap();

        let mut proxy = DeviceEntry::new(DeviceKind::Proxy, "prx");
        proxy.upstream = Some(UpstreamEntry {
            host: "127.0.0.1".to_string(),
            port: 4223,
            retry_interval_ms: None,
        });
        catalog.add(&mut daemon, &proxy).await.unwrap();

        let err = catalog
            .add(&mut daemon, &DeviceEntry::new(DeviceKind::AmbientLightV3, "EALV3"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaemonError>(),
            Some(DaemonError::DuplicateDevice { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_entries() {
        let catalog = DeviceCatalog::new().unwrap();
        let mut daemon = BrickDaemon::new(DaemonConfig::new("127.0.0.1:0"));

        let err = catalog
            .add(&mut daemon, &DeviceEntry::new(DeviceKind::Proxy, "prx"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("needs an upstream"));

        let err = catalog
            .add(&mut daemon, &DeviceEntry::new(DeviceKind::AmbientLightV3, "0OIl"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid UID"));

        assert!(catalog
            .add(&mut daemon, &DeviceEntry::new(DeviceKind::AmbientLightV3, "1"))
            .await
            .is_err());
    }
}
