//! Packets tagged with their origin.
//!
//! The tags never travel on the wire. They exist so diagnostics can follow
//! one request through the broker, a device and the passthrough bridge.

use std::fmt;
use std::net::SocketAddr;

use crate::packet::Packet;

/// What a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A function call sent to a device.
    Request,
    /// The answer to a request.
    Response,
    /// A spontaneous notification (sequence number 0).
    Callback,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Callback => "callback",
        })
    }
}

/// Where a message came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// An API client connected to the daemon.
    Client(SocketAddr),
    /// An emulated device.
    Emulator,
    /// The upstream daemon behind a passthrough bridge (`host:port`).
    Passthrough(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(addr) => write!(f, "client {addr}"),
            Self::Emulator => f.write_str("emulator"),
            Self::Passthrough(peer) => write!(f, "passthrough {peer}"),
        }
    }
}

/// A packet plus its origin and trace number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Origin.
    pub source: Source,
    /// Monotonic trace number assigned by the daemon, if any.
    pub trace: Option<u64>,
    /// The wire packet.
    pub packet: Packet,
}

impl Message {
    /// Creates an untraced message.
    #[must_use]
    pub const fn new(kind: MessageKind, source: Source, packet: Packet) -> Self {
        Self {
            kind,
            source,
            trace: None,
            packet,
        }
    }

    /// Creates a request from a client.
    #[must_use]
    pub const fn request(peer: SocketAddr, packet: Packet) -> Self {
        Self::new(MessageKind::Request, Source::Client(peer), packet)
    }

    /// Sets the trace number.
    #[must_use]
    pub fn with_trace(mut self, trace: u64) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Creates a response to this message carrying `packet`, keeping the trace.
    #[must_use]
    pub const fn reply(&self, source: Source, packet: Packet) -> Self {
        Self {
            kind: MessageKind::Response,
            source,
            trace: self.trace,
            packet,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.kind, self.source)?;
        if let Some(trace) = self.trace {
            write!(f, " [trace {trace}]")?;
        }
        write!(f, ": {}", self.packet)
    }
}
