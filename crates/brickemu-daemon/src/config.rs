//! Daemon and device configuration.
//!
//! # Debug Resolution
//!
//! Per-packet diagnostics are gated by a debug flag resolved in three levels:
//! a device's own override wins, then the daemon's override, then the global
//! flag of the daemon configuration. See [`resolve_debug`].

use std::fmt;
use std::time::Duration;

use brickemu_core::Uid;
use thiserror::Error;

/// Default listen address (the standard Brick Daemon port).
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4223";

/// Default maximum number of concurrent client connections.
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Delay between passthrough connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Width of the connected-UID field in identity payloads.
pub const CONNECTED_UID_WIDTH: usize = 8;

/// Identity values that cannot be encoded into an identity payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The position is not a single Latin-1 character.
    #[error("position {position:?} is not a Latin-1 character")]
    Position {
        /// Rejected position.
        position: char,
    },

    /// The connected UID is not Latin-1 or longer than its field.
    #[error("connected UID {connected_uid:?} must be at most {CONNECTED_UID_WIDTH} Latin-1 characters")]
    ConnectedUid {
        /// Rejected UID text.
        connected_uid: String,
    },
}

const fn is_latin1(c: char) -> bool {
    (c as u32) <= 0xFF
}

/// Resolves the effective debug flag.
#[must_use]
pub const fn resolve_debug(device: Option<bool>, daemon: Option<bool>, global: bool) -> bool {
    match (device, daemon) {
        (Some(flag), _) | (None, Some(flag)) => flag,
        (None, None) => global,
    }
}

/// Configuration for [`BrickDaemon`](crate::BrickDaemon).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Address to listen on (`host:port`).
    pub listen_addr: String,

    /// Global debug flag, the lowest level of the debug chain.
    pub global_debug: bool,

    /// Daemon-level debug override.
    pub debug: Option<bool>,

    /// Send direct responses to every client instead of only the requester.
    pub broadcast_responses: bool,

    /// Maximum concurrent client connections.
    pub max_clients: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            global_debug: false,
            debug: None,
            broadcast_responses: false,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

impl DaemonConfig {
    /// Creates a config listening on `listen_addr`.
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    /// Sets the global debug flag.
    #[must_use]
    pub const fn with_global_debug(mut self, debug: bool) -> Self {
        self.global_debug = debug;
        self
    }

    /// Sets the daemon-level debug override.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Broadcasts direct responses to every client.
    #[must_use]
    pub const fn with_broadcast_responses(mut self, broadcast: bool) -> Self {
        self.broadcast_responses = broadcast;
        self
    }

    /// Sets the maximum concurrent client connections.
    #[must_use]
    pub const fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Debug flag for the daemon itself.
    #[must_use]
    pub const fn debug_enabled(&self) -> bool {
        resolve_debug(None, self.debug, self.global_debug)
    }
}

/// Address of the upstream daemon behind a passthrough bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamTarget {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl UpstreamTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What to do with traffic that has no passthrough handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassthroughPolicy {
    /// Forward requests for unknown function IDs upstream instead of
    /// answering function-not-supported.
    pub unknown_requests: bool,
    /// Forward upstream responses without a handler.
    pub unknown_responses: bool,
    /// Forward upstream callbacks without a handler.
    pub unknown_callbacks: bool,
}

impl PassthroughPolicy {
    /// Forwards everything.
    #[must_use]
    pub const fn forward_all() -> Self {
        Self {
            unknown_requests: true,
            unknown_responses: true,
            unknown_callbacks: true,
        }
    }
}

/// Identity reported by get-identity and enumeration callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// UID of the parent device (`"0"` for none).
    pub connected_uid: String,
    /// Position on the parent (`'a'`..`'h'`, `'0'`..`'8'`, `'?'`).
    pub position: char,
    /// Hardware version.
    pub hardware_version: [u8; 3],
    /// Firmware version.
    pub firmware_version: [u8; 3],
    /// Tinkerforge device identifier.
    pub device_identifier: u16,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            connected_uid: "0".to_string(),
            position: '?',
            hardware_version: [1, 0, 0],
            firmware_version: [2, 0, 0],
            device_identifier: 0,
        }
    }
}

impl Identity {
    /// Creates the default identity with a device identifier.
    #[must_use]
    pub fn new(device_identifier: u16) -> Self {
        Self {
            device_identifier,
            ..Default::default()
        }
    }

    /// Sets the parent UID and position.
    ///
    /// # Errors
    ///
    /// Returns an error if either value does not fit its identity field.
    pub fn with_connection(
        mut self,
        connected_uid: impl Into<String>,
        position: char,
    ) -> Result<Self, IdentityError> {
        self.connected_uid = connected_uid.into();
        self.position = position;
        self.validate()?;
        Ok(self)
    }

    /// Checks that the identity can be encoded.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-Latin-1 position, or a connected UID that
    /// is not Latin-1 or longer than [`CONNECTED_UID_WIDTH`].
    pub fn validate(&self) -> Result<(), IdentityError> {
        if !is_latin1(self.position) {
            return Err(IdentityError::Position {
                position: self.position,
            });
        }
        if self.connected_uid.chars().count() > CONNECTED_UID_WIDTH
            || !self.connected_uid.chars().all(is_latin1)
        {
            return Err(IdentityError::ConnectedUid {
                connected_uid: self.connected_uid.clone(),
            });
        }
        Ok(())
    }

    /// Sets hardware and firmware versions.
    #[must_use]
    pub const fn with_versions(mut self, hardware: [u8; 3], firmware: [u8; 3]) -> Self {
        self.hardware_version = hardware;
        self.firmware_version = firmware;
        self
    }
}

/// Configuration of one emulated device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device UID.
    pub uid: Uid,

    /// Device-level debug override.
    pub debug: Option<bool>,

    /// Upstream daemon for passthrough, if any.
    pub upstream: Option<UpstreamTarget>,

    /// Handling of unknown traffic.
    pub passthrough: PassthroughPolicy,

    /// Delay between passthrough connection attempts.
    pub retry_interval: Duration,

    /// Initial identity.
    pub identity: Identity,
}

impl DeviceConfig {
    /// Creates a config for `uid` with defaults.
    #[must_use]
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            debug: None,
            upstream: None,
            passthrough: PassthroughPolicy::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            identity: Identity::default(),
        }
    }

    /// Sets the device-level debug override.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Enables passthrough to `target`.
    #[must_use]
    pub fn with_upstream(mut self, target: UpstreamTarget) -> Self {
        self.upstream = Some(target);
        self
    }

    /// Sets the unknown-traffic policy.
    #[must_use]
    pub const fn with_passthrough_policy(mut self, policy: PassthroughPolicy) -> Self {
        self.passthrough = policy;
        self
    }

    /// Sets the passthrough retry interval.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the initial identity.
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }
}
