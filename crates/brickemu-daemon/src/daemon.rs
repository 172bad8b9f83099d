//! The emulated Brick Daemon.
//!
//! [`BrickDaemon`] is the public face of the broker. Devices can be added and
//! removed at any time: while the daemon is stopped the registry is changed
//! directly, while it runs the change is queued to the broker task and takes
//! effect between two routing decisions.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use brickemu_daemon::{BrickDaemon, DaemonConfig, Device, DeviceConfig, FunctionTable};
//! use brickemu_core::Uid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let table = Arc::new(FunctionTable::<()>::builder("ExampleBricklet").with_enumerate().build()?);
//! let device = Device::new(DeviceConfig::new(Uid::parse("abc")?), table, ())?;
//!
//! let mut daemon = BrickDaemon::new(DaemonConfig::new("127.0.0.1:4223"));
//! daemon.add_device(device.clone()).await?;
//! let addr = daemon.start().await?;
//! println!("listening on {addr}");
//! daemon.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use brickemu_core::Uid;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{self, Broker, BrokerEvent};
use crate::config::DaemonConfig;
use crate::device::EmulatedDevice;

/// Errors raised by daemon operations.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A device with the same UID is already registered.
    #[error("device with UID {uid} already added")]
    DuplicateDevice {
        /// Conflicting UID.
        uid: Uid,
    },

    /// No device is registered under the UID.
    #[error("no device with UID {uid} added")]
    DeviceNotFound {
        /// Requested UID.
        uid: Uid,
    },

    /// A different device instance is registered under the UID.
    #[error("a different device with UID {uid} is added")]
    DeviceMismatch {
        /// Requested UID.
        uid: Uid,
    },

    /// `start` was called on a running daemon.
    #[error("daemon already running")]
    AlreadyRunning,

    /// `stop` was called on a stopped daemon, or the daemon stopped while a
    /// change was queued.
    #[error("daemon not running")]
    NotRunning,

    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Listen address.
        addr: String,
        /// I/O error.
        #[source]
        source: io::Error,
    },

    /// The broker task failed.
    #[error("daemon task failed: {0}")]
    TaskFailed(String),
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

struct Running {
    events: mpsc::UnboundedSender<BrokerEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Broker>,
    local_addr: SocketAddr,
}

/// A restartable emulated Brick Daemon.
pub struct BrickDaemon {
    config: DaemonConfig,
    broker: Option<Broker>,
    running: Option<Running>,
}

impl std::fmt::Debug for BrickDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickDaemon")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl BrickDaemon {
    /// Creates a stopped daemon without devices.
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            broker: Some(Broker::new(config.clone())),
            config,
            running: None,
        }
    }

    /// Daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Returns `true` while the daemon runs.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while the daemon runs.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Binds the listen address and starts serving clients and devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon already runs or the address cannot be
    /// bound.
    pub async fn start(&mut self) -> DaemonResult<SocketAddr> {
        if self.running.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }
        let Some(broker) = self.broker.take() else {
            return Err(DaemonError::TaskFailed("device registry lost".into()));
        };

        let listener = match broker::bind(&self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.broker = Some(broker);
                return Err(e);
            },
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.broker = Some(broker);
                return Err(DaemonError::Bind {
                    addr: self.config.listen_addr.clone(),
                    source,
                });
            },
        };

        info!(
            addr = %local_addr,
            devices = broker.device_count(),
            "Daemon listening"
        );

        let events = broker.events();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(broker.run(listener, cancel.clone()));

        self.running = Some(Running {
            events,
            cancel,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stops serving: closes all client connections and stops all devices.
    /// Registered devices stay registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is not running or its task failed.
    pub async fn stop(&mut self) -> DaemonResult<()> {
        let Some(running) = self.running.take() else {
            return Err(DaemonError::NotRunning);
        };
        running.cancel.cancel();
        let broker = running
            .task
            .await
            .map_err(|e| DaemonError::TaskFailed(e.to_string()))?;
        self.broker = Some(broker);
        Ok(())
    }

    /// Registers a device and emits its connected enumeration callback.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::DuplicateDevice`] if the UID is taken.
    pub async fn add_device(&mut self, device: impl EmulatedDevice) -> DaemonResult<()> {
        let device: Arc<dyn EmulatedDevice> = Arc::new(device);

        if let Some(broker) = self.broker.as_mut() {
            return broker.add_device(device, None);
        }

        let (reply, rx) = oneshot::channel();
        self.send(BrokerEvent::AddDevice { device, reply })?;
        rx.await.map_err(|_| DaemonError::NotRunning)?
    }

    /// Emits the disconnected enumeration callback of a device, stops it and
    /// unregisters it.
    ///
    /// # Errors
    ///
    /// Returns an error if no device with that UID is registered, or the
    /// registered device is a different instance.
    pub async fn remove_device(&mut self, device: &dyn EmulatedDevice) -> DaemonResult<()> {
        let uid_number = device.uid().number();
        let instance_id = device.instance_id();

        if let Some(broker) = self.broker.as_mut() {
            return broker.remove_device(uid_number, instance_id).await;
        }

        let (reply, rx) = oneshot::channel();
        self.send(BrokerEvent::RemoveDevice {
            uid_number,
            instance_id,
            reply,
        })?;
        rx.await.map_err(|_| DaemonError::NotRunning)?
    }

    fn send(&self, event: BrokerEvent) -> DaemonResult<()> {
        let running = self.running.as_ref().ok_or(DaemonError::NotRunning)?;
        running.events.send(event).map_err(|_| DaemonError::NotRunning)
    }
}

impl Drop for BrickDaemon {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
        }
    }
}
