//! Packet framing for `tokio_util` codecs.
//!
//! The stream is a plain concatenation of packets. The length byte at
//! offset 4 determines where the next packet starts, so a bad length leaves
//! no way to resynchronize: every framing error terminates the stream.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::{MAX_PACKET_LEN, MIN_PACKET_LEN, Packet};

/// Extra validation applied to decoded packets depending on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePolicy {
    /// Length checks only.
    Any,
    /// Packets from API clients: requests must carry a sequence number.
    Client,
    /// Packets from an upstream daemon: nonzero UID and function ID, and the
    /// response-expected flag set.
    Upstream,
}

impl FramePolicy {
    /// Validates a packet against the policy.
    ///
    /// # Errors
    ///
    /// Returns the framing error describing the violation.
    pub fn check(self, packet: &Packet) -> ProtocolResult<()> {
        match self {
            Self::Any => Ok(()),
            Self::Client => {
                if packet.sequence_number() == 0 {
                    return Err(ProtocolError::ZeroSequenceNumber);
                }
                Ok(())
            },
            Self::Upstream => {
                if packet.uid_number() == 0 {
                    return Err(ProtocolError::ZeroUid);
                }
                if packet.function_id() == 0 {
                    return Err(ProtocolError::ZeroFunctionId);
                }
                if !packet.response_expected() {
                    return Err(ProtocolError::MissingResponseExpected);
                }
                Ok(())
            },
        }
    }
}

/// Codec turning a byte stream into [`Packet`]s and back.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    policy: FramePolicy,
}

impl PacketCodec {
    /// Creates a codec with the given policy.
    #[must_use]
    pub const fn new(policy: FramePolicy) -> Self {
        Self { policy }
    }

    /// Codec for connections accepted from API clients.
    #[must_use]
    pub const fn client() -> Self {
        Self::new(FramePolicy::Client)
    }

    /// Codec for passthrough connections to an upstream daemon.
    #[must_use]
    pub const fn upstream() -> Self {
        Self::new(FramePolicy::Upstream)
    }

    /// Returns the validation policy.
    #[must_use]
    pub const fn policy(&self) -> FramePolicy {
        self.policy
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(FramePolicy::Any)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // The length byte is all we need to know how much to wait for.
        if src.len() < 5 {
            return Ok(None);
        }

        let length = usize::from(src[4]);
        if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&length) {
            return Err(ProtocolError::InvalidLength { length });
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let packet = Packet::from_bytes(src.split_to(length).freeze())?;
        self.policy.check(&packet)?;
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(packet.length());
        dst.put_slice(packet.as_bytes());
        Ok(())
    }
}
