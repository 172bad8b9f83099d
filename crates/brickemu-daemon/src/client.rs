//! API client connections.
//!
//! Each accepted TCP connection runs as its own task: decoded requests are
//! tagged with a trace number and handed to the broker, and messages queued
//! for the client are written in queue order. A framing error closes the
//! connection, since the stream cannot be resynchronized.

use std::net::SocketAddr;

use brickemu_core::{Message, PacketCodec};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broker::BrokerEvent;
use crate::link::{ResponseSink, TraceCounter};

/// One connected API client.
pub(crate) struct ClientConnection {
    id: u64,
    peer: SocketAddr,
    framed: Framed<TcpStream, PacketCodec>,
    outbound: mpsc::UnboundedReceiver<Message>,
    sink: ResponseSink,
    events: mpsc::UnboundedSender<BrokerEvent>,
    traces: TraceCounter,
    debug: bool,
    _permit: OwnedSemaphorePermit,
}

impl ClientConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        outbound: mpsc::UnboundedReceiver<Message>,
        sink: ResponseSink,
        events: mpsc::UnboundedSender<BrokerEvent>,
        traces: TraceCounter,
        debug: bool,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
        Self {
            id,
            peer,
            framed: Framed::new(stream, PacketCodec::client()),
            outbound,
            sink,
            events,
            traces,
            debug,
            _permit: permit,
        }
    }

    /// Serves the client until it disconnects or `cancel` fires.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let peer = self.peer;
        if self.debug {
            debug!(client = %peer, "Client connected");
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(message) = self.outbound.recv() => {
                    if self.debug {
                        debug!(client = %peer, %message, "Sending to client");
                    }
                    if let Err(e) = self.framed.send(message.packet).await {
                        if self.debug {
                            error!(client = %peer, error = %e, "Error while sending, disconnecting client");
                        }
                        break;
                    }
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(packet)) => {
                        let request = Message::request(peer, packet).with_trace(self.traces.next_trace());
                        if self.debug {
                            debug!(%request, "Received request");
                        }
                        let event = BrokerEvent::Request {
                            request,
                            sink: self.sink.clone(),
                        };
                        if self.events.send(event).is_err() {
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        if self.debug {
                            error!(client = %peer, error = %e, "Error while receiving, disconnecting client");
                        }
                        break;
                    },
                    None => {
                        if self.debug {
                            debug!(client = %peer, "Client disconnected by peer");
                        }
                        break;
                    },
                },
            }
        }

        if let Err(e) = self.framed.close().await {
            if self.debug {
                debug!(client = %peer, error = %e, "Error while closing client connection");
            }
        }
        let _ = self.events.send(BrokerEvent::ClientClosed(self.id));
    }
}
