//! Packet envelope.
//!
//! Every packet starts with an 8-byte header:
//!
//! ```text
//! +-------------+--------+-------------+------------------+-----------+---------+
//! | UID (u32 LE)| length | function ID | seq<<4 | resp<<3 | err<<6    | payload |
//! +-------------+--------+-------------+------------------+-----------+---------+
//!   bytes 0..4    byte 4   byte 5        byte 6             byte 7      8..length
//! ```
//!
//! A [`Packet`] owns a validated buffer: `8 <= length <= 80` and the buffer
//! is exactly `length` bytes long. Accessors read straight from the header.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Header size and minimum packet length.
pub const MIN_PACKET_LEN: usize = 8;

/// Maximum packet length.
pub const MAX_PACKET_LEN: usize = 80;

/// Maximum payload length.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - MIN_PACKET_LEN;

/// Largest sequence number (4 bits).
pub const MAX_SEQUENCE_NUMBER: u8 = 15;

/// Disconnect probe sent by bindings to UID 0.
pub const FUNCTION_DISCONNECT_PROBE: u8 = 128;

/// Set bootloader mode.
pub const FUNCTION_SET_BOOTLOADER_MODE: u8 = 235;

/// Get bootloader mode.
pub const FUNCTION_GET_BOOTLOADER_MODE: u8 = 236;

/// Set status LED config.
pub const FUNCTION_SET_STATUS_LED_CONFIG: u8 = 239;

/// Get status LED config.
pub const FUNCTION_GET_STATUS_LED_CONFIG: u8 = 240;

/// Enumeration callback.
pub const CALLBACK_ENUMERATE: u8 = 253;

/// Enumerate request.
pub const FUNCTION_ENUMERATE: u8 = 254;

/// Get identity request.
pub const FUNCTION_GET_IDENTITY: u8 = 255;

/// Function IDs that application functions may never use.
pub const RESERVED_FUNCTION_IDS: [u8; 3] = [CALLBACK_ENUMERATE, FUNCTION_ENUMERATE, FUNCTION_GET_IDENTITY];

const HEADER_LEN: u8 = 8;
const RESPONSE_EXPECTED_BIT: u8 = 1 << 3;
const ERROR_CODE_SHIFT: u8 = 6;

/// Two-bit error code carried in byte 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// Malformed or out-of-range arguments.
    InvalidParameter = 1,
    /// The function is not implemented.
    FunctionNotSupported = 2,
    /// Reserved.
    Unknown = 3,
}

impl ErrorCode {
    /// Decodes the two error bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Ok,
            1 => Self::InvalidParameter,
            2 => Self::FunctionNotSupported,
            _ => Self::Unknown,
        }
    }
}

/// Key correlating a forwarded request with its upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestMatch {
    /// Device UID number.
    pub uid_number: u32,
    /// Function ID.
    pub function_id: u8,
    /// Sequence number.
    pub sequence_number: u8,
}

/// A validated protocol packet.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    bytes: Bytes,
}

impl Packet {
    /// Validates a complete packet buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidLength`] if the buffer is shorter than
    /// a header or the length byte is out of range, and
    /// [`ProtocolError::LengthMismatch`] if the buffer size differs from the
    /// length byte.
    pub fn from_bytes(bytes: Bytes) -> ProtocolResult<Self> {
        if bytes.len() < MIN_PACKET_LEN {
            return Err(ProtocolError::InvalidLength { length: bytes.len() });
        }

        let declared = usize::from(bytes[4]);
        if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&declared) {
            return Err(ProtocolError::InvalidLength { length: declared });
        }
        if declared != bytes.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        Ok(Self { bytes })
    }

    /// Builds a packet from its header fields and payload.
    ///
    /// Only the low four bits of `sequence_number` are used.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn new(
        uid_number: u32,
        function_id: u8,
        sequence_number: u8,
        response_expected: bool,
        payload: &[u8],
    ) -> ProtocolResult<Self> {
        let mut flags = (sequence_number & MAX_SEQUENCE_NUMBER) << 4;
        if response_expected {
            flags |= RESPONSE_EXPECTED_BIT;
        }
        Self::assemble(uid_number, function_id, flags, 0, payload)
    }

    /// Builds a callback packet (sequence number 0, response-expected set).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn callback(uid_number: u32, function_id: u8, payload: &[u8]) -> ProtocolResult<Self> {
        Self::new(uid_number, function_id, 0, true, payload)
    }

    /// Builds a response to this packet: same header, new payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn response_with_payload(&self, payload: &[u8]) -> ProtocolResult<Self> {
        Self::assemble(
            self.uid_number(),
            self.function_id(),
            self.bytes[6],
            self.bytes[7],
            payload,
        )
    }

    /// Builds an error response: same header, length 8, error code set.
    #[must_use]
    pub fn error_response(&self, code: ErrorCode) -> Self {
        let mut header = self.header();
        header[4] = HEADER_LEN;
        header[7] |= (code as u8) << ERROR_CODE_SHIFT;
        Self {
            bytes: Bytes::copy_from_slice(&header),
        }
    }

    fn assemble(
        uid_number: u32,
        function_id: u8,
        seq_flags: u8,
        error_flags: u8,
        payload: &[u8],
    ) -> ProtocolResult<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let length = MIN_PACKET_LEN + payload.len();
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u32_le(uid_number);
        buf.put_u8(u8::try_from(length).map_err(|_| ProtocolError::InvalidLength { length })?);
        buf.put_u8(function_id);
        buf.put_u8(seq_flags);
        buf.put_u8(error_flags);
        buf.put_slice(payload);

        Ok(Self { bytes: buf.freeze() })
    }

    /// Returns a copy of the 8-byte header.
    #[must_use]
    pub fn header(&self) -> [u8; 8] {
        let mut header = [0; 8];
        header.copy_from_slice(&self.bytes[..MIN_PACKET_LEN]);
        header
    }

    /// Destination (requests) or source (responses, callbacks) UID.
    #[must_use]
    pub fn uid_number(&self) -> u32 {
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    /// Total packet length including the header.
    #[must_use]
    pub fn length(&self) -> usize {
        usize::from(self.bytes[4])
    }

    /// Function ID.
    #[must_use]
    pub fn function_id(&self) -> u8 {
        self.bytes[5]
    }

    /// Sequence number (0 for callbacks).
    #[must_use]
    pub fn sequence_number(&self) -> u8 {
        self.bytes[6] >> 4
    }

    /// Whether the sender expects a response.
    #[must_use]
    pub fn response_expected(&self) -> bool {
        self.bytes[6] & RESPONSE_EXPECTED_BIT != 0
    }

    /// Error code carried in byte 7.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_bits(self.bytes[7] >> ERROR_CODE_SHIFT)
    }

    /// Payload bytes after the header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[MIN_PACKET_LEN..]
    }

    /// Returns `true` for callbacks (sequence number 0).
    #[must_use]
    pub fn is_callback(&self) -> bool {
        self.sequence_number() == 0
    }

    /// Correlation key for this packet.
    #[must_use]
    pub fn request_match(&self) -> RequestMatch {
        RequestMatch {
            uid_number: self.uid_number(),
            function_id: self.function_id(),
            sequence_number: self.sequence_number(),
        }
    }

    /// The raw wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the packet and returns the wire bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("uid_number", &self.uid_number())
            .field("length", &self.length())
            .field("function_id", &self.function_id())
            .field("sequence_number", &self.sequence_number())
            .field("response_expected", &self.response_expected())
            .field("error_code", &self.error_code())
            .field("payload", &self.payload())
            .finish()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uid={} len={} fid={} seq={} resp={} err={}",
            self.uid_number(),
            self.length(),
            self.function_id(),
            self.sequence_number(),
            u8::from(self.response_expected()),
            self.error_code() as u8,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(payload: &[u8]) -> Packet {
        Packet::new(436_811_748, 5, 7, true, payload).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let packet = request(&[1, 2]);
        assert_eq!(
            packet.as_bytes(),
            [0xE4, 0x37, 0x09, 0x1A, 10, 5, 0x78, 0x00, 1, 2]
        );
        assert_eq!(packet.uid_number(), 436_811_748);
        assert_eq!(packet.length(), 10);
        assert_eq!(packet.function_id(), 5);
        assert_eq!(packet.sequence_number(), 7);
        assert!(packet.response_expected());
        assert_eq!(packet.error_code(), ErrorCode::Ok);
        assert_eq!(packet.payload(), [1, 2]);
        assert!(!packet.is_callback());
    }

    #[test]
    fn test_every_valid_length_accepted() {
        for length in MIN_PACKET_LEN..=MAX_PACKET_LEN {
            let mut raw = vec![0u8; length];
            raw[4] = u8::try_from(length).unwrap();
            let packet = Packet::from_bytes(Bytes::from(raw)).unwrap();
            assert_eq!(packet.length(), length);
            assert_eq!(packet.payload().len(), length - MIN_PACKET_LEN);
        }
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        for length in [0u8, 4, 7, 81, 255] {
            let mut raw = vec![0u8; 8];
            raw[4] = length;
            assert!(matches!(
                Packet::from_bytes(Bytes::from(raw)),
                Err(ProtocolError::InvalidLength { .. })
            ));
        }
        assert!(matches!(
            Packet::from_bytes(Bytes::from_static(&[0, 0, 0, 0, 8])),
            Err(ProtocolError::InvalidLength { length: 5 })
        ));
        assert!(matches!(
            Packet::from_bytes(Bytes::from_static(&[0, 0, 0, 0, 9, 0, 0, 0])),
            Err(ProtocolError::LengthMismatch {
                declared: 9,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_error_response_keeps_header() {
        let packet = request(&[1, 2, 3]);
        let response = packet.error_response(ErrorCode::InvalidParameter);
        assert_eq!(response.length(), 8);
        assert!(response.payload().is_empty());
        assert_eq!(response.uid_number(), packet.uid_number());
        assert_eq!(response.function_id(), packet.function_id());
        assert_eq!(response.sequence_number(), packet.sequence_number());
        assert!(response.response_expected());
        assert_eq!(response.error_code(), ErrorCode::InvalidParameter);
        assert_eq!(response.as_bytes()[7], 0b0100_0000);

        let response = packet.error_response(ErrorCode::FunctionNotSupported);
        assert_eq!(response.as_bytes()[7], 0b1000_0000);
    }

    #[test]
    fn test_response_with_payload() {
        let packet = request(&[]);
        let response = packet.response_with_payload(&[9; 4]).unwrap();
        assert_eq!(response.length(), 12);
        assert_eq!(response.header()[5..], packet.header()[5..]);
        assert_eq!(response.payload(), [9; 4]);
    }

    #[test]
    fn test_callback_header() {
        let packet = Packet::callback(42, CALLBACK_ENUMERATE, &[0; 26]).unwrap();
        assert_eq!(packet.sequence_number(), 0);
        assert!(packet.response_expected());
        assert!(packet.is_callback());
        assert_eq!(packet.as_bytes()[6], 0x08);
        assert_eq!(packet.as_bytes()[7], 0);
    }

    #[test]
    fn test_payload_too_large() {
        assert!(Packet::new(1, 1, 1, true, &[0; MAX_PAYLOAD_LEN]).is_ok());
        assert!(matches!(
            Packet::new(1, 1, 1, true, &[0; MAX_PAYLOAD_LEN + 1]),
            Err(ProtocolError::PayloadTooLarge { size: 73, max: 72 })
        ));
    }

    #[test]
    fn test_request_match() {
        let packet = request(&[]);
        assert_eq!(
            packet.request_match(),
            RequestMatch {
                uid_number: 436_811_748,
                function_id: 5,
                sequence_number: 7,
            }
        );
    }
}
