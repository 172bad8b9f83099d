//! Ambient Light Bricklet 3.0.
//!
//! The illuminance ramps up by 10 every 100 ms and wraps back to 10 once it
//! exceeds 1000. The period-based illuminance callback honors the threshold
//! option and the value-has-to-change flag.

use std::time::Duration;

use brickemu_core::{Format, Value};
use brickemu_daemon::{
    Args, DeviceContext, FunctionTable, HandlerError, HandlerResult, Outcome, TableError,
};
use tracing::error;

/// Device identifier of the Ambient Light Bricklet 3.0.
pub const DEVICE_IDENTIFIER: u16 = 2131;

/// Device type name.
pub const TYPE_NAME: &str = "AmbientLightV3Bricklet";

const FUNCTION_GET_ILLUMINANCE: u8 = 1;
const FUNCTION_SET_ILLUMINANCE_CALLBACK_CONFIGURATION: u8 = 2;
const FUNCTION_GET_ILLUMINANCE_CALLBACK_CONFIGURATION: u8 = 3;
const CALLBACK_ILLUMINANCE: u8 = 4;
const FUNCTION_SET_CONFIGURATION: u8 = 5;
const FUNCTION_GET_CONFIGURATION: u8 = 6;

const CALLBACK_CONFIGURATION_FORMAT: &str = "I ! c I I";

const RAMP_INTERVAL: Duration = Duration::from_millis(100);
const RAMP_STEP: u32 = 10;
const RAMP_START: u32 = 10;
const RAMP_MAX: u32 = 1000;

/// Highest valid illuminance range (unlimited).
pub const MAX_ILLUMINANCE_RANGE: u8 = 6;

/// Highest valid integration time (400 ms).
pub const MAX_INTEGRATION_TIME: u8 = 7;

/// When the period-based callback fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThresholdOption {
    /// Every period.
    #[default]
    Off,
    /// Value outside `[min, max]`.
    Outside,
    /// Value inside `[min, max]`.
    Inside,
    /// Value below `min`.
    Smaller,
    /// Value above `min`.
    Greater,
}

impl ThresholdOption {
    /// Wire character of the option.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Off => 'x',
            Self::Outside => 'o',
            Self::Inside => 'i',
            Self::Smaller => '<',
            Self::Greater => '>',
        }
    }

    /// Returns `true` if `value` passes the threshold.
    #[must_use]
    pub const fn matches(self, value: u32, min: u32, max: u32) -> bool {
        match self {
            Self::Off => true,
            Self::Outside => value < min || value > max,
            Self::Inside => value >= min && value <= max,
            Self::Smaller => value < min,
            Self::Greater => value > min,
        }
    }
}

impl TryFrom<char> for ThresholdOption {
    type Error = char;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        Ok(match c {
            'x' => Self::Off,
            'o' => Self::Outside,
            'i' => Self::Inside,
            '<' => Self::Smaller,
            '>' => Self::Greater,
            other => return Err(other),
        })
    }
}

/// Configuration of the illuminance callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackConfiguration {
    /// Period in milliseconds, 0 disables the callback.
    pub period: u32,
    /// Skip periods in which the value did not change.
    pub value_has_to_change: bool,
    /// Threshold option.
    pub option: ThresholdOption,
    /// Lower threshold.
    pub min: u32,
    /// Upper threshold.
    pub max: u32,
}

/// State of one Ambient Light Bricklet 3.0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbientLightV3 {
    /// Current illuminance in 1/100 lux.
    pub illuminance: u32,
    /// Illuminance range constant.
    pub illuminance_range: u8,
    /// Integration time constant.
    pub integration_time: u8,
    /// Illuminance callback configuration.
    pub callback: CallbackConfiguration,
}

impl Default for AmbientLightV3 {
    fn default() -> Self {
        Self {
            illuminance: RAMP_START,
            illuminance_range: 3,
            integration_time: 2,
            callback: CallbackConfiguration::default(),
        }
    }
}

impl AmbientLightV3 {
    /// Advances the illuminance ramp by one step.
    pub const fn step(&mut self) {
        self.illuminance += RAMP_STEP;
        if self.illuminance > RAMP_MAX {
            self.illuminance = RAMP_START;
        }
    }
}

/// Builds the function table shared by all instances.
///
/// # Errors
///
/// Returns an error if a registration is rejected.
pub fn table() -> Result<FunctionTable<AmbientLightV3>, TableError> {
    FunctionTable::builder(TYPE_NAME)
        .function(FUNCTION_GET_ILLUMINANCE, "get_illuminance", "", "I", get_illuminance)
        .function(
            FUNCTION_SET_ILLUMINANCE_CALLBACK_CONFIGURATION,
            "set_illuminance_callback_configuration",
            CALLBACK_CONFIGURATION_FORMAT,
            "",
            set_illuminance_callback_configuration,
        )
        .function(
            FUNCTION_GET_ILLUMINANCE_CALLBACK_CONFIGURATION,
            "get_illuminance_callback_configuration",
            "",
            CALLBACK_CONFIGURATION_FORMAT,
            get_illuminance_callback_configuration,
        )
        .function(
            FUNCTION_SET_CONFIGURATION,
            "set_configuration",
            "B B",
            "",
            set_configuration,
        )
        .function(
            FUNCTION_GET_CONFIGURATION,
            "get_configuration",
            "",
            "B B",
            get_configuration,
        )
        .autorun("emulate", emulate)
        .autorun("illuminance_callback", illuminance_callback)
        .with_enumerate()
        .with_bootloader()
        .build()
}

async fn get_illuminance(ctx: DeviceContext<AmbientLightV3>, _args: Args) -> HandlerResult<Outcome> {
    Ok(Outcome::value(ctx.state().await.illuminance))
}

async fn set_illuminance_callback_configuration(
    ctx: DeviceContext<AmbientLightV3>,
    args: Args,
) -> HandlerResult<Outcome> {
    let option = args.char(2)?;
    let option = ThresholdOption::try_from(option)
        .map_err(|c| HandlerError::invalid_argument(2, format!("unknown threshold option {c:?}")))?;

    ctx.state().await.callback = CallbackConfiguration {
        period: args.get(0)?,
        value_has_to_change: args.get(1)?,
        option,
        min: args.get(3)?,
        max: args.get(4)?,
    };
    Ok(Outcome::Done)
}

async fn get_illuminance_callback_configuration(
    ctx: DeviceContext<AmbientLightV3>,
    _args: Args,
) -> HandlerResult<Outcome> {
    let config = ctx.state().await.callback;
    Ok(Outcome::values(vec![
        Value::U32(config.period),
        Value::Bool(config.value_has_to_change),
        Value::Char(config.option.as_char()),
        Value::U32(config.min),
        Value::U32(config.max),
    ]))
}

async fn set_configuration(ctx: DeviceContext<AmbientLightV3>, args: Args) -> HandlerResult<Outcome> {
    let illuminance_range: u8 = args.get(0)?;
    let integration_time: u8 = args.get(1)?;
    if illuminance_range > MAX_ILLUMINANCE_RANGE {
        return Err(HandlerError::invalid_argument(
            0,
            format!("illuminance range {illuminance_range} out of range"),
        ));
    }
    if integration_time > MAX_INTEGRATION_TIME {
        return Err(HandlerError::invalid_argument(
            1,
            format!("integration time {integration_time} out of range"),
        ));
    }

    let mut state = ctx.state().await;
    state.illuminance_range = illuminance_range;
    state.integration_time = integration_time;
    Ok(Outcome::Done)
}

async fn get_configuration(ctx: DeviceContext<AmbientLightV3>, _args: Args) -> HandlerResult<Outcome> {
    let state = ctx.state().await;
    Ok(Outcome::values(vec![
        Value::U8(state.illuminance_range),
        Value::U8(state.integration_time),
    ]))
}

async fn emulate(ctx: DeviceContext<AmbientLightV3>) {
    loop {
        tokio::time::sleep(RAMP_INTERVAL).await;
        ctx.state().await.step();
    }
}

async fn illuminance_callback(ctx: DeviceContext<AmbientLightV3>) {
    let format = match Format::parse("I") {
        Ok(format) => format,
        Err(e) => {
            error!(uid = %ctx.uid(), error = %e, "Invalid illuminance callback format");
            return;
        },
    };
    let mut last_sent = None;

    loop {
        let config = ctx.state().await.callback;
        if config.period == 0 {
            last_sent = None;
            tokio::time::sleep(RAMP_INTERVAL).await;
            continue;
        }

        tokio::time::sleep(Duration::from_millis(u64::from(config.period))).await;

        let illuminance = ctx.state().await.illuminance;
        if config.value_has_to_change && last_sent == Some(illuminance) {
            continue;
        }
        if !config.option.matches(illuminance, config.min, config.max) {
            continue;
        }

        if let Err(e) = ctx.emit_callback(
            CALLBACK_ILLUMINANCE,
            "illuminance",
            &format,
            &[Value::U32(illuminance)],
        ) {
            error!(uid = %ctx.uid(), error = %e, "Failed to emit illuminance callback");
        }
        last_sent = Some(illuminance);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use brickemu_core::packet::CALLBACK_ENUMERATE;
    use brickemu_core::{FramePolicy, Packet, PacketCodec, Uid};
    use brickemu_daemon::{BrickDaemon, DaemonConfig, Device, DeviceConfig, Identity};
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    use super::*;

    fn context() -> DeviceContext<AmbientLightV3> {
        let config = DeviceConfig::new(Uid::parse("EALV3").unwrap());
        let device = Device::new(config, Arc::new(table().unwrap()), AmbientLightV3::default()).unwrap();
        device.context().clone()
    }

    #[test]
    fn test_ramp_wraps() {
        let mut state = AmbientLightV3::default();
        assert_eq!(state.illuminance, 10);
        state.step();
        assert_eq!(state.illuminance, 20);

        state.illuminance = 1000;
        state.step();
        assert_eq!(state.illuminance, 10);
    }

    #[test]
    fn test_threshold_options() {
        assert!(ThresholdOption::Off.matches(5, 10, 20));
        assert!(ThresholdOption::Outside.matches(5, 10, 20));
        assert!(!ThresholdOption::Outside.matches(15, 10, 20));
        assert!(ThresholdOption::Inside.matches(20, 10, 20));
        assert!(ThresholdOption::Smaller.matches(9, 10, 0));
        assert!(ThresholdOption::Greater.matches(11, 10, 0));
        assert!(!ThresholdOption::Greater.matches(10, 10, 0));

        for c in ['x', 'o', 'i', '<', '>'] {
            assert_eq!(ThresholdOption::try_from(c).unwrap().as_char(), c);
        }
        assert_eq!(ThresholdOption::try_from('?'), Err('?'));
    }

    #[test]
    fn test_table_layout() {
        let table = table().unwrap();
        assert_eq!(
            table.request_ids(),
            vec![1, 2, 3, 5, 6, 235, 236, 239, 240, 254, 255]
        );
        assert_eq!(table.autoruns().len(), 2);
    }

    #[tokio::test]
    async fn test_configuration_validation() {
        let ctx = context();
        let result = set_configuration(ctx.clone(), Args::new(vec![Value::U8(7), Value::U8(0)])).await;
        assert!(matches!(result, Err(HandlerError::InvalidArgument { index: 0, .. })));
        let result = set_configuration(ctx.clone(), Args::new(vec![Value::U8(0), Value::U8(8)])).await;
        assert!(matches!(result, Err(HandlerError::InvalidArgument { index: 1, .. })));

        set_configuration(ctx.clone(), Args::new(vec![Value::U8(6), Value::U8(7)]))
            .await
            .unwrap();
        let values = get_configuration(ctx, Args::default()).await.unwrap();
        assert_eq!(values, Outcome::values(vec![Value::U8(6), Value::U8(7)]));
    }

    #[tokio::test]
    async fn test_callback_configuration_round_trip() {
        let ctx = context();
        let args = vec![
            Value::U32(250),
            Value::Bool(true),
            Value::Char('>'),
            Value::U32(500),
            Value::U32(0),
        ];
        set_illuminance_callback_configuration(ctx.clone(), Args::new(args.clone()))
            .await
            .unwrap();
        assert_eq!(
            get_illuminance_callback_configuration(ctx.clone(), Args::default())
                .await
                .unwrap(),
            Outcome::values(args)
        );

        let bad = vec![
            Value::U32(0),
            Value::Bool(false),
            Value::Char('?'),
            Value::U32(0),
            Value::U32(0),
        ];
        assert!(set_illuminance_callback_configuration(ctx, Args::new(bad)).await.is_err());
    }

    #[tokio::test]
    async fn test_illuminance_callback_over_tcp() {
        let config = DeviceConfig::new(Uid::parse("EALV3").unwrap())
            .with_identity(Identity::new(DEVICE_IDENTIFIER));
        let device = Device::new(config, Arc::new(table().unwrap()), AmbientLightV3::default()).unwrap();
        let mut daemon = BrickDaemon::new(DaemonConfig::new("127.0.0.1:0"));
        daemon.add_device(device).await.unwrap();
        let addr = daemon.start().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, PacketCodec::new(FramePolicy::Any));
        let uid = Uid::parse("EALV3").unwrap().number();

        let mut payload = 100u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0, b'x']);
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        let request = Packet::new(uid, FUNCTION_SET_ILLUMINANCE_CALLBACK_CONFIGURATION, 1, true, &payload).unwrap();
        client.send(request).await.unwrap();

        let timeout = Duration::from_secs(5);
        let ack = tokio::time::timeout(timeout, client.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(ack.function_id(), FUNCTION_SET_ILLUMINANCE_CALLBACK_CONFIGURATION);
        assert_eq!(ack.length(), 8);

        let callback = loop {
            let packet = tokio::time::timeout(timeout, client.next()).await.unwrap().unwrap().unwrap();
            if packet.function_id() != CALLBACK_ENUMERATE {
                break packet;
            }
        };
        assert_eq!(callback.function_id(), CALLBACK_ILLUMINANCE);
        assert_eq!(callback.sequence_number(), 0);
        let illuminance = u32::from_le_bytes(callback.payload().try_into().unwrap());
        assert!((10..=1000).contains(&illuminance));

        daemon.stop().await.unwrap();
    }
}
