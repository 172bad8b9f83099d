//! Protocol error types.

use std::io;

use thiserror::Error;

use crate::packet::{MAX_PACKET_LEN, MIN_PACKET_LEN};

/// Errors that terminate a packet stream.
///
/// Every variant except [`ProtocolError::PayloadTooLarge`] is a framing error:
/// the connection carrying the offending bytes must be closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The length byte is outside the permitted range.
    #[error("invalid packet length {length} (expected {MIN_PACKET_LEN}..={MAX_PACKET_LEN})")]
    InvalidLength {
        /// The length byte read from the header.
        length: usize,
    },

    /// A buffer does not match the length declared in its header.
    #[error("packet declares {declared} bytes but carries {actual}")]
    LengthMismatch {
        /// Length byte from the header.
        declared: usize,
        /// Actual buffer length.
        actual: usize,
    },

    /// A client sent a request with sequence number 0.
    #[error("request with sequence number 0")]
    ZeroSequenceNumber,

    /// The upstream peer sent a packet for UID 0.
    #[error("packet with UID 0")]
    ZeroUid,

    /// The upstream peer sent a packet with function ID 0.
    #[error("packet with function ID 0")]
    ZeroFunctionId,

    /// The upstream peer sent a packet without the response-expected bit.
    #[error("packet without response-expected flag")]
    MissingResponseExpected,

    /// A payload does not fit into a single packet.
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },
}

impl ProtocolError {
    /// Returns `true` if the error was caused by the transport rather than
    /// by malformed bytes.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
