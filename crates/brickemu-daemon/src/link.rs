//! Channels connecting devices, clients and the broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use brickemu_core::Message;
use tokio::sync::mpsc;

use crate::broker::BrokerEvent;
use crate::config::resolve_debug;

/// Shared monotonic trace counter, starting at 1.
#[derive(Debug, Clone)]
pub struct TraceCounter {
    next: Arc<AtomicU64>,
}

impl TraceCounter {
    /// Creates a counter whose first value is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns the next trace number.
    #[must_use]
    pub fn next_trace(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TraceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound queue of the client that sent a request.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ResponseSink {
    /// Wraps a client's outbound queue.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Creates a sink and the receiving end of its queue.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queues a message. Returns `false` if the client is gone.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Returns `true` if the client is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A device's connection to the daemon it was added to.
#[derive(Debug, Clone)]
pub struct DaemonLink {
    events: mpsc::UnboundedSender<BrokerEvent>,
    traces: TraceCounter,
    daemon_debug: Option<bool>,
    global_debug: bool,
    broadcast_responses: bool,
}

impl DaemonLink {
    pub(crate) const fn new(
        events: mpsc::UnboundedSender<BrokerEvent>,
        traces: TraceCounter,
        daemon_debug: Option<bool>,
        global_debug: bool,
        broadcast_responses: bool,
    ) -> Self {
        Self {
            events,
            traces,
            daemon_debug,
            global_debug,
            broadcast_responses,
        }
    }

    /// Next daemon-wide trace number.
    #[must_use]
    pub fn next_trace(&self) -> u64 {
        self.traces.next_trace()
    }

    /// Resolves the debug flag for a device with the given override.
    #[must_use]
    pub const fn debug(&self, device: Option<bool>) -> bool {
        resolve_debug(device, self.daemon_debug, self.global_debug)
    }

    /// Whether direct responses go to every client.
    #[must_use]
    pub const fn broadcast_responses(&self) -> bool {
        self.broadcast_responses
    }

    /// Queues a message for every connected client.
    pub fn broadcast(&self, message: Message) {
        // the broker only goes away together with the daemon
        let _ = self.events.send(BrokerEvent::Broadcast(message));
    }
}
