//! Emulated Tinkerforge Brick Daemon.
//!
//! API clients connect over TCP and talk to emulated devices exactly as they
//! would to a real Brick Daemon. Each device type is described once by a
//! [`FunctionTable`]; each [`Device`] instance pairs a table with its own
//! state and runs its handlers, background tasks and optional passthrough
//! bridge to a real upstream daemon.
//!
//! # Module Overview
//!
//! - [`config`]: daemon and device configuration ([`DaemonConfig`],
//!   [`DeviceConfig`])
//! - [`handler`]: handler outcomes and arguments ([`Outcome`], [`Args`])
//! - [`table`]: per-type dispatch tables ([`FunctionTable`])
//! - [`capability`]: enumerate/identity and bootloader functions
//! - [`device`]: the device runtime ([`Device`], [`DeviceContext`])
//! - [`passthrough`]: the bridge to an upstream daemon
//! - [`broker`]: request routing
//! - [`daemon`]: the public daemon handle ([`BrickDaemon`])
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use brickemu_core::Uid;
//! use brickemu_daemon::{
//!     Args, BrickDaemon, DaemonConfig, Device, DeviceConfig, DeviceContext, FunctionTable,
//!     HandlerResult, Outcome,
//! };
//!
//! async fn get_value(ctx: DeviceContext<u32>, _args: Args) -> HandlerResult<Outcome> {
//!     Ok(Outcome::value(*ctx.state().await))
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let table = FunctionTable::builder("CounterBricklet")
//!     .function(1, "get_value", "", "I", get_value)
//!     .with_enumerate()
//!     .build()?;
//! let device = Device::new(DeviceConfig::new(Uid::parse("ctr")?), Arc::new(table), 42)?;
//!
//! let mut daemon = BrickDaemon::new(DaemonConfig::default());
//! daemon.add_device(device).await?;
//! daemon.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod capability;
mod client;
pub mod config;
pub mod daemon;
pub mod device;
pub mod handler;
pub mod link;
pub mod passthrough;
pub mod table;

pub use broker::{Broker, BrokerEvent};
pub use capability::{
    BootloaderMode, BootloaderState, BootloaderStatus, Capabilities, EnumerationType, StatusLedConfig,
};
pub use config::{
    DaemonConfig, DeviceConfig, Identity, IdentityError, PassthroughPolicy, UpstreamTarget,
};
pub use daemon::{BrickDaemon, DaemonError, DaemonResult};
pub use device::{Device, DeviceContext, DeviceError, EmulatedDevice};
pub use handler::{Args, HandlerError, HandlerResult, Outcome};
pub use link::{DaemonLink, ResponseSink, TraceCounter};
pub use passthrough::BridgeError;
pub use table::{FunctionTable, FunctionTableBuilder, TableError, UpstreamCategory};
