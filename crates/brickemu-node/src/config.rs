//! Process configuration: environment variables and the device manifest.
//!
//! # Environment
//!
//! - `BRICKEMU_ADDR`: listen address, overrides the manifest
//! - `BRICKEMU_DEBUG`: global debug flag (`1`, `true`, `yes`, `on`)
//! - `BRICKEMU_DEVICES`: path to a JSON device manifest
//!
//! Without a manifest a single Ambient Light Bricklet 3.0 with UID `EALV3` is
//! emulated.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use brickemu_daemon::config::DEFAULT_LISTEN_ADDR;
use brickemu_daemon::{DaemonConfig, Identity, IdentityError, PassthroughPolicy};
use serde::Deserialize;

/// Settings read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConfig {
    pub listen_addr: Option<String>,
    pub debug: bool,
    pub manifest_path: Option<PathBuf>,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("BRICKEMU_ADDR").filter(|addr| !addr.trim().is_empty());

        let debug = match lookup("BRICKEMU_DEBUG") {
            Some(value) => parse_flag(&value).context("failed to parse BRICKEMU_DEBUG")?,
            None => false,
        };

        let manifest_path = lookup("BRICKEMU_DEVICES")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            listen_addr,
            debug,
            manifest_path,
        })
    }

    /// Loads the manifest, or the default one if no path is configured.
    pub fn manifest(&self) -> Result<Manifest> {
        match &self.manifest_path {
            Some(path) => Manifest::load(path),
            None => Ok(Manifest::default()),
        }
    }

    /// Daemon configuration: environment first, then manifest, then defaults.
    pub fn daemon_config(&self, manifest: &Manifest) -> DaemonConfig {
        let listen_addr = self
            .listen_addr
            .clone()
            .or_else(|| manifest.listen_addr.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

        let mut config = DaemonConfig::new(listen_addr)
            .with_global_debug(self.debug)
            .with_broadcast_responses(manifest.broadcast_responses);
        if let Some(debug) = manifest.debug {
            config = config.with_debug(debug);
        }
        if let Some(max) = manifest.max_clients {
            config = config.with_max_clients(max);
        }
        config
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid flag value {other:?}"),
    }
}

/// Device manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Daemon-level debug override.
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub broadcast_responses: bool,
    #[serde(default)]
    pub max_clients: Option<usize>,
    pub devices: Vec<DeviceEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            listen_addr: None,
            debug: None,
            broadcast_responses: false,
            max_clients: None,
            devices: vec![DeviceEntry::new(DeviceKind::AmbientLightV3, "EALV3")],
        }
    }
}

impl Manifest {
    /// Reads and parses a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read device manifest {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse device manifest {}", path.display()))?;
        manifest
            .validate()
            .with_context(|| format!("invalid device manifest {}", path.display()))?;
        Ok(manifest)
    }

    /// Checks the values serde cannot check.
    pub fn validate(&self) -> Result<()> {
        for entry in &self.devices {
            entry
                .identity(0)
                .with_context(|| format!("invalid identity for device {}", entry.uid))?;
        }
        Ok(())
    }
}

/// Emulated device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AmbientLightV3,
    Proxy,
}

impl DeviceKind {
    /// Passthrough policy used when the manifest does not give one.
    pub const fn default_policy(self) -> PassthroughPolicy {
        match self {
            Self::AmbientLightV3 => PassthroughPolicy {
                unknown_requests: false,
                unknown_responses: false,
                unknown_callbacks: false,
            },
            Self::Proxy => PassthroughPolicy::forward_all(),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AmbientLightV3 => "ambient_light_v3",
            Self::Proxy => "proxy",
        })
    }
}

/// One device of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub kind: DeviceKind,
    pub uid: String,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub upstream: Option<UpstreamEntry>,
    #[serde(default)]
    pub passthrough: Option<PassthroughEntry>,
    #[serde(default)]
    pub connected_uid: Option<String>,
    #[serde(default)]
    pub position: Option<char>,
    #[serde(default)]
    pub hardware_version: Option<[u8; 3]>,
    #[serde(default)]
    pub firmware_version: Option<[u8; 3]>,
}

impl DeviceEntry {
    pub fn new(kind: DeviceKind, uid: impl Into<String>) -> Self {
        Self {
            kind,
            uid: uid.into(),
            debug: None,
            upstream: None,
            passthrough: None,
            connected_uid: None,
            position: None,
            hardware_version: None,
            firmware_version: None,
        }
    }

    /// Identity with the manifest's overrides applied.
    pub fn identity(&self, device_identifier: u16) -> Result<Identity, IdentityError> {
        let defaults = Identity::new(device_identifier);
        let connected_uid = self
            .connected_uid
            .clone()
            .unwrap_or_else(|| defaults.connected_uid.clone());
        let position = self.position.unwrap_or(defaults.position);
        let hardware = self.hardware_version.unwrap_or(defaults.hardware_version);
        let firmware = self.firmware_version.unwrap_or(defaults.firmware_version);

        Ok(defaults
            .with_connection(connected_uid, position)?
            .with_versions(hardware, firmware))
    }

    /// Effective passthrough policy.
    pub fn passthrough_policy(&self) -> PassthroughPolicy {
        self.passthrough
            .map_or_else(|| self.kind.default_policy(), PassthroughPolicy::from)
    }
}

/// Upstream daemon of a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamEntry {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub retry_interval_ms: Option<u64>,
}

impl UpstreamEntry {
    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_ms.map(Duration::from_millis)
    }
}

/// Unknown-traffic forwarding flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PassthroughEntry {
    pub unknown_requests: bool,
    pub unknown_responses: bool,
    pub unknown_callbacks: bool,
}

impl From<PassthroughEntry> for PassthroughPolicy {
    fn from(entry: PassthroughEntry) -> Self {
        Self {
            unknown_requests: entry.unknown_requests,
            unknown_responses: entry.unknown_responses,
            unknown_callbacks: entry.unknown_callbacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_env_defaults() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, NodeConfig::default());

        let daemon = config.daemon_config(&Manifest::default());
        assert_eq!(daemon.listen_addr, "0.0.0.0:4223");
        assert!(!daemon.global_debug);
        assert_eq!(daemon.debug, None);
    }

    #[test]
    fn test_env_values() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("BRICKEMU_ADDR", "127.0.0.1:5555"),
            ("BRICKEMU_DEBUG", "yes"),
            ("BRICKEMU_DEVICES", "/tmp/devices.json"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr.as_deref(), Some("127.0.0.1:5555"));
        assert!(config.debug);
        assert_eq!(config.manifest_path, Some(PathBuf::from("/tmp/devices.json")));

        assert!(NodeConfig::from_lookup(lookup(&[("BRICKEMU_DEBUG", "maybe")])).is_err());
    }

    #[test]
    fn test_env_address_overrides_manifest() {
        let manifest = Manifest {
            listen_addr: Some("127.0.0.1:1000".to_string()),
            debug: Some(true),
            max_clients: Some(2),
            ..Manifest::default()
        };

        let from_manifest = NodeConfig::default().daemon_config(&manifest);
        assert_eq!(from_manifest.listen_addr, "127.0.0.1:1000");
        assert_eq!(from_manifest.debug, Some(true));
        assert_eq!(from_manifest.max_clients, 2);

        let config = NodeConfig {
            listen_addr: Some("127.0.0.1:2000".to_string()),
            ..NodeConfig::default()
        };
        assert_eq!(config.daemon_config(&manifest).listen_addr, "127.0.0.1:2000");
    }

    #[test]
    fn test_default_manifest() {
        let manifest = NodeConfig::default().manifest().unwrap();
        assert_eq!(manifest.devices.len(), 1);
        assert_eq!(manifest.devices[0].kind, DeviceKind::AmbientLightV3);
        assert_eq!(manifest.devices[0].uid, "EALV3");
    }

    #[test]
    fn test_load_manifest_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "broadcast_responses": true,
                "devices": [
                    {{ "kind": "ambient_light_v3", "uid": "EALV3", "position": "a", "hardware_version": [3, 0, 0] }},
                    {{
                        "kind": "proxy",
                        "uid": "prx",
                        "upstream": {{ "host": "192.168.0.10", "port": 4223, "retry_interval_ms": 500 }},
                        "passthrough": {{ "unknown_requests": true }}
                    }}
                ]
            }}"#
        )
        .unwrap();

        let config = NodeConfig {
            manifest_path: Some(file.path().to_path_buf()),
            ..NodeConfig::default()
        };
        let manifest = config.manifest().unwrap();
        assert!(manifest.broadcast_responses);
        assert_eq!(manifest.devices.len(), 2);

        let light = &manifest.devices[0];
        let identity = light.identity(2131).unwrap();
        assert_eq!(identity.position, 'a');
        assert_eq!(identity.connected_uid, "0");
        assert_eq!(identity.hardware_version, [3, 0, 0]);
        assert_eq!(identity.firmware_version, [2, 0, 0]);
        assert_eq!(identity.device_identifier, 2131);
        assert_eq!(light.passthrough_policy(), PassthroughPolicy::default());

        let proxy = &manifest.devices[1];
        let upstream = proxy.upstream.as_ref().unwrap();
        assert_eq!(upstream.host, "192.168.0.10");
        assert_eq!(upstream.retry_interval(), Some(Duration::from_millis(500)));
        let policy = proxy.passthrough_policy();
        assert!(policy.unknown_requests);
        assert!(!policy.unknown_responses);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "devices": [ {{ "kind": "proxy", "uid": "x", "colour": "red" }} ] }}"#).unwrap();
        let err = Manifest::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("colour"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "devices": [ {{ "kind": "toaster", "uid": "x" }} ] }}"#).unwrap();
        assert!(Manifest::load(file.path()).is_err());
    }

    #[test]
    fn test_unencodable_identity_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "devices": [ {{ "kind": "ambient_light_v3", "uid": "EALV3", "position": "€" }} ] }}"#
        )
        .unwrap();
        let err = Manifest::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("position"), "{err:#}");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "devices": [ {{ "kind": "ambient_light_v3", "uid": "EALV3", "connected_uid": "123456789" }} ] }}"#
        )
        .unwrap();
        let err = Manifest::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("connected UID"), "{err:#}");

        let mut entry = DeviceEntry::new(DeviceKind::AmbientLightV3, "EALV3");
        entry.position = Some('\u{e9}');
        assert_eq!(entry.identity(2131).unwrap().position, '\u{e9}');
    }

    #[test]
    fn test_missing_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read device manifest"));
    }

    #[test]
    fn test_proxy_forwards_everything_by_default() {
        let entry = DeviceEntry::new(DeviceKind::Proxy, "prx");
        assert_eq!(entry.passthrough_policy(), PassthroughPolicy::forward_all());
    }
}
