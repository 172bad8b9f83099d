//! Built-in device capabilities.
//!
//! Instead of inspecting device types at runtime, a device type opts into
//! capabilities when its [`FunctionTable`](crate::FunctionTable) is built:
//!
//! - **enumerate**: functions 254 (enumerate) and 255 (get identity), plus
//!   enumeration callbacks (253) when the device is added to or removed from a
//!   daemon.
//! - **bootloader**: the co-processor bootloader functions 235, 236, 239 and
//!   240 with their mode and status-LED state.

use brickemu_core::packet::{
    FUNCTION_ENUMERATE, FUNCTION_GET_BOOTLOADER_MODE, FUNCTION_GET_IDENTITY,
    FUNCTION_GET_STATUS_LED_CONFIG, FUNCTION_SET_BOOTLOADER_MODE, FUNCTION_SET_STATUS_LED_CONFIG,
};
use brickemu_core::{CodecResult, Format, Uid, Value};

use crate::config::Identity;
use crate::device::DeviceContext;
use crate::handler::{Args, HandlerError, HandlerResult, Outcome};
use crate::table::{FunctionTableBuilder, function_handler};

/// Payload format of get-identity responses.
pub const IDENTITY_FORMAT: &str = "8s 8s c 3B 3B H";

/// Payload format of enumeration callbacks.
pub const ENUMERATE_CALLBACK_FORMAT: &str = "8s 8s c 3B 3B H B";

/// Capabilities installed into a function table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Enumerate and get-identity.
    pub enumerate: bool,
    /// Bootloader mode and status LED.
    pub bootloader: bool,
}

/// Reason carried by an enumeration callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnumerationType {
    /// Answer to an enumerate request.
    Available = 0,
    /// The device was added.
    Connected = 1,
    /// The device was removed.
    Disconnected = 2,
}

/// Bootloader mode of a co-processor bricklet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BootloaderMode {
    /// Running the bootloader.
    Bootloader = 0,
    /// Running the firmware.
    #[default]
    Firmware = 1,
    /// Bootloader, reboot pending.
    BootloaderWaitForReboot = 2,
    /// Firmware, reboot pending.
    FirmwareWaitForReboot = 3,
    /// Firmware, erase and reboot pending.
    FirmwareWaitForEraseAndReboot = 4,
}

impl TryFrom<u8> for BootloaderMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Bootloader,
            1 => Self::Firmware,
            2 => Self::BootloaderWaitForReboot,
            3 => Self::FirmwareWaitForReboot,
            4 => Self::FirmwareWaitForEraseAndReboot,
            other => return Err(other),
        })
    }
}

/// Status LED configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusLedConfig {
    /// Always off.
    Off = 0,
    /// Always on.
    On = 1,
    /// Heartbeat.
    ShowHeartbeat = 2,
    /// Communication status.
    #[default]
    ShowStatus = 3,
}

impl TryFrom<u8> for StatusLedConfig {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Off,
            1 => Self::On,
            2 => Self::ShowHeartbeat,
            3 => Self::ShowStatus,
            other => return Err(other),
        })
    }
}

/// Status returned by set-bootloader-mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BootloaderStatus {
    /// Mode changed.
    Ok = 0,
    /// Unknown mode.
    InvalidMode = 1,
    /// Already in that mode.
    NoChange = 2,
}

/// Bootloader capability state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootloaderState {
    /// Current mode.
    pub mode: BootloaderMode,
    /// Current status LED configuration.
    pub status_led: StatusLedConfig,
}

impl BootloaderState {
    /// Applies a raw mode value and reports the outcome.
    pub fn set_mode(&mut self, raw: u8) -> BootloaderStatus {
        match BootloaderMode::try_from(raw) {
            Err(_) => BootloaderStatus::InvalidMode,
            Ok(mode) if mode == self.mode => BootloaderStatus::NoChange,
            Ok(mode) => {
                self.mode = mode;
                BootloaderStatus::Ok
            },
        }
    }
}

/// Values of a get-identity response.
#[must_use]
pub fn identity_values(uid: &Uid, identity: &Identity) -> Vec<Value> {
    vec![
        Value::from(uid.as_str()),
        Value::from(identity.connected_uid.as_str()),
        Value::Char(identity.position),
        Value::from(identity.hardware_version),
        Value::from(identity.firmware_version),
        Value::U16(identity.device_identifier),
    ]
}

/// Values of an enumeration callback.
///
/// Disconnected callbacks carry only the UID; every other field is zeroed.
#[must_use]
pub fn enumeration_values(uid: &Uid, identity: &Identity, kind: EnumerationType) -> Vec<Value> {
    let mut values = match kind {
        EnumerationType::Disconnected => vec![
            Value::from(uid.as_str()),
            Value::from(""),
            Value::Char('\0'),
            Value::from([0u8; 3]),
            Value::from([0u8; 3]),
            Value::U16(0),
        ],
        EnumerationType::Available | EnumerationType::Connected => identity_values(uid, identity),
    };
    values.push(Value::U8(kind as u8));
    values
}

/// Parsed enumeration callback format.
pub(crate) fn enumerate_callback_format() -> CodecResult<Format> {
    Format::parse(ENUMERATE_CALLBACK_FORMAT)
}

async fn enumerate<S: Send + 'static>(ctx: DeviceContext<S>, _args: Args) -> HandlerResult<Outcome> {
    ctx.announce(EnumerationType::Available);
    Ok(Outcome::Done)
}

async fn get_identity<S: Send + 'static>(ctx: DeviceContext<S>, _args: Args) -> HandlerResult<Outcome> {
    Ok(Outcome::values(identity_values(ctx.uid(), &ctx.identity())))
}

async fn set_bootloader_mode<S: Send + 'static>(ctx: DeviceContext<S>, args: Args) -> HandlerResult<Outcome> {
    let raw: u8 = args.get(0)?;
    let status = ctx.update_bootloader(|state| state.set_mode(raw));
    Ok(Outcome::value(status as u8))
}

async fn get_bootloader_mode<S: Send + 'static>(ctx: DeviceContext<S>, _args: Args) -> HandlerResult<Outcome> {
    Ok(Outcome::value(ctx.bootloader().mode as u8))
}

async fn set_status_led_config<S: Send + 'static>(ctx: DeviceContext<S>, args: Args) -> HandlerResult<Outcome> {
    let raw: u8 = args.get(0)?;
    let config = StatusLedConfig::try_from(raw)
        .map_err(|raw| HandlerError::invalid_argument(0, format!("unknown status LED config {raw}")))?;
    ctx.update_bootloader(|state| state.status_led = config);
    Ok(Outcome::Done)
}

async fn get_status_led_config<S: Send + 'static>(ctx: DeviceContext<S>, _args: Args) -> HandlerResult<Outcome> {
    Ok(Outcome::value(ctx.bootloader().status_led as u8))
}

pub(crate) fn install_enumerate<S: Send + 'static>(builder: FunctionTableBuilder<S>) -> FunctionTableBuilder<S> {
    builder
        .add_function(FUNCTION_ENUMERATE, "enumerate", "", "", function_handler(enumerate))
        .add_function(
            FUNCTION_GET_IDENTITY,
            "get_identity",
            "",
            IDENTITY_FORMAT,
            function_handler(get_identity),
        )
}

pub(crate) fn install_bootloader<S: Send + 'static>(builder: FunctionTableBuilder<S>) -> FunctionTableBuilder<S> {
    builder
        .add_function(
            FUNCTION_SET_BOOTLOADER_MODE,
            "set_bootloader_mode",
            "B",
            "B",
            function_handler(set_bootloader_mode),
        )
        .add_function(
            FUNCTION_GET_BOOTLOADER_MODE,
            "get_bootloader_mode",
            "",
            "B",
            function_handler(get_bootloader_mode),
        )
        .add_function(
            FUNCTION_SET_STATUS_LED_CONFIG,
            "set_status_led_config",
            "B",
            "",
            function_handler(set_status_led_config),
        )
        .add_function(
            FUNCTION_GET_STATUS_LED_CONFIG,
            "get_status_led_config",
            "",
            "B",
            function_handler(get_status_led_config),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_payload_layout() {
        let uid = Uid::parse("EALV3").unwrap();
        let identity = Identity::new(2131).with_connection("abc", 'a').unwrap();
        let format = Format::parse(IDENTITY_FORMAT).unwrap();
        let payload = format.pack(&identity_values(&uid, &identity)).unwrap();

        assert_eq!(payload.len(), 25);
        assert_eq!(&payload[..8], b"EALV3\0\0\0");
        assert_eq!(&payload[8..16], b"abc\0\0\0\0\0");
        assert_eq!(payload[16], b'a');
        assert_eq!(&payload[17..20], [1, 0, 0]);
        assert_eq!(&payload[20..23], [2, 0, 0]);
        assert_eq!(&payload[23..], 2131u16.to_le_bytes());
    }

    #[test]
    fn test_disconnected_enumeration_is_zeroed() {
        let uid = Uid::parse("EALV3").unwrap();
        let identity = Identity::new(2131);
        let format = enumerate_callback_format().unwrap();
        let payload = format
            .pack(&enumeration_values(&uid, &identity, EnumerationType::Disconnected))
            .unwrap();

        assert_eq!(payload.len(), 26);
        assert_eq!(&payload[..8], b"EALV3\0\0\0");
        assert!(payload[8..25].iter().all(|&b| b == 0));
        assert_eq!(payload[25], 2);
    }

    #[test]
    fn test_connected_enumeration_carries_identity() {
        let uid = Uid::parse("EALV3").unwrap();
        let identity = Identity::new(2131);
        let values = enumeration_values(&uid, &identity, EnumerationType::Connected);
        assert_eq!(values.len(), 7);
        assert_eq!(values[6], Value::U8(1));
        assert_eq!(values[5], Value::U16(2131));
    }

    #[test]
    fn test_bootloader_mode_transitions() {
        let mut state = BootloaderState::default();
        assert_eq!(state.mode, BootloaderMode::Firmware);
        assert_eq!(state.status_led, StatusLedConfig::ShowStatus);

        assert_eq!(state.set_mode(1), BootloaderStatus::NoChange);
        assert_eq!(state.set_mode(9), BootloaderStatus::InvalidMode);
        assert_eq!(state.set_mode(0), BootloaderStatus::Ok);
        assert_eq!(state.mode, BootloaderMode::Bootloader);
    }

    #[test]
    fn test_status_led_values() {
        assert_eq!(StatusLedConfig::try_from(2), Ok(StatusLedConfig::ShowHeartbeat));
        assert_eq!(StatusLedConfig::try_from(4), Err(4));
    }
}
