//! Wire-level building blocks of the Tinkerforge TCP/IP protocol.
//!
//! # Module Overview
//!
//! - [`uid`]: base-58 device UIDs ([`Uid`])
//! - [`codec`]: payload codec driven by format specifiers ([`Format`],
//!   [`Value`])
//! - [`packet`]: the 8-byte header envelope ([`Packet`], [`ErrorCode`])
//! - [`framing`]: `tokio_util` codec splitting a stream into packets
//!   ([`PacketCodec`])
//! - [`message`]: packets tagged with origin and trace number ([`Message`])
//! - [`error`]: framing errors ([`ProtocolError`])
//!
//! # Example
//!
//! ```
//! use brickemu_core::{Format, Packet, Value};
//!
//! let format: Format = "8s 8s c 3B 3B H".parse().unwrap();
//! let payload = format
//!     .pack(&[
//!         Value::from("EALV3"),
//!         Value::from("0"),
//!         Value::Char('?'),
//!         Value::from([1u8, 0, 0]),
//!         Value::from([2u8, 0, 0]),
//!         Value::U16(2131),
//!     ])
//!     .unwrap();
//! let request = Packet::new(436_811_748, 255, 1, true, &[]).unwrap();
//! let response = request.response_with_payload(&payload).unwrap();
//! assert_eq!(response.length(), 8 + 25);
//! ```

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod packet;
pub mod uid;

pub use codec::{CodecError, CodecResult, Field, FieldType, Format, Value};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FramePolicy, PacketCodec};
pub use message::{Message, MessageKind, Source};
pub use packet::{ErrorCode, Packet, RequestMatch};
pub use uid::{Uid, UidError};
