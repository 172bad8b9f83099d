//! Passthrough bridge to an upstream Brick Daemon.
//!
//! A device configured with an [`UpstreamTarget`](crate::config::UpstreamTarget)
//! keeps one TCP connection to that daemon for as long as it runs. Requests
//! selected for passthrough are written upstream in queue order; packets from
//! upstream are filtered and routed back:
//!
//! - packets addressed to another UID are ignored
//! - a response matching a pending request `(uid, function ID, sequence
//!   number)` goes to the client that sent the request, first match wins
//! - unmatched responses and all callbacks go to every client
//!
//! Connection failures are retried every `retry_interval`. A connection lost
//! after it was established is re-opened immediately. Requests still waiting
//! for a response when the connection drops are abandoned.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;

use brickemu_core::{
    CodecError, Message, MessageKind, Packet, PacketCodec, ProtocolError, RequestMatch, Source,
};
use futures::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UpstreamTarget;
use crate::device::{DeviceContext, QueuedRequest};
use crate::handler::{Args, HandlerError};
use crate::link::ResponseSink;
use crate::table::UpstreamCategory;

/// Reasons for dropping an upstream connection.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Framing or socket failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The upstream daemon closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// An upstream payload did not match the filter's format.
    #[error("error while unpacking {packet} for {function} {category}: {source}")]
    Unpack {
        /// The offending packet.
        packet: Packet,
        /// Filter signature.
        function: String,
        /// Response or callback.
        category: UpstreamCategory,
        /// Codec error.
        #[source]
        source: CodecError,
    },

    /// A filter failed.
    #[error("error while handling {packet} for {function} {category}: {source}")]
    Filter {
        /// The offending packet.
        packet: Packet,
        /// Filter signature.
        function: String,
        /// Response or callback.
        category: UpstreamCategory,
        /// Handler error.
        #[source]
        source: HandlerError,
    },
}

/// A forwarded request waiting for its upstream response.
struct PendingRequest {
    key: RequestMatch,
    request: Message,
    sink: ResponseSink,
}

enum Exit {
    Cancelled,
    Disconnected(BridgeError),
}

/// Runs the bridge of one device until `cancel` fires.
///
/// Without an upstream target this only waits for cancellation.
pub(crate) async fn run_bridge<S: Send + 'static>(ctx: DeviceContext<S>, cancel: CancellationToken) {
    let Some(target) = ctx.config().upstream.clone() else {
        cancel.cancelled().await;
        return;
    };

    let peer = format!("{}@{target}", ctx.uid());
    let mut queue = ctx.passthrough_queue().await;
    let mut pending = VecDeque::new();

    loop {
        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = connect(&target) => result,
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                if ctx.debug() {
                    error!(passthrough = %peer, error = %e, "Failed to connect to upstream daemon");
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(ctx.config().retry_interval) => continue,
                }
            },
        };

        if ctx.debug() {
            info!(passthrough = %peer, "Passthrough connected");
        }

        let mut framed = Framed::new(stream, PacketCodec::upstream());
        let exit = forward(&ctx, &peer, &mut framed, &mut queue, &mut pending, &cancel).await;

        if let Err(e) = framed.close().await {
            if ctx.debug() {
                debug!(passthrough = %peer, error = %e, "Error while closing upstream connection");
            }
        }

        for abandoned in pending.drain(..) {
            let PendingRequest { request, .. } = abandoned;
            if ctx.debug() {
                warn!(passthrough = %peer, %request, "Abandoning request, passthrough disconnected");
            }
        }

        match exit {
            Exit::Cancelled => return,
            Exit::Disconnected(BridgeError::Closed) => {
                if ctx.debug() {
                    info!(passthrough = %peer, "Passthrough disconnected by peer");
                }
            },
            Exit::Disconnected(e) => {
                if ctx.debug() {
                    error!(passthrough = %peer, error = %e, "Disconnecting passthrough");
                }
            },
        }
    }
}

async fn connect(target: &UpstreamTarget) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn forward<S: Send + 'static>(
    ctx: &DeviceContext<S>,
    peer: &str,
    framed: &mut Framed<TcpStream, PacketCodec>,
    queue: &mut mpsc::UnboundedReceiver<QueuedRequest>,
    pending: &mut VecDeque<PendingRequest>,
    cancel: &CancellationToken,
) -> Exit {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Exit::Cancelled,
            item = queue.recv() => {
                let Some((request, sink)) = item else {
                    return Exit::Cancelled;
                };
                if ctx.debug() {
                    debug!(passthrough = %peer, %request, "Sending request to passthrough");
                }
                if let Err(e) = framed.send(request.packet.clone()).await {
                    return Exit::Disconnected(e.into());
                }
                if request.packet.response_expected() {
                    pending.push_back(PendingRequest {
                        key: request.packet.request_match(),
                        request,
                        sink,
                    });
                }
            },
            frame = framed.next() => {
                let packet = match frame {
                    Some(Ok(packet)) => packet,
                    Some(Err(e)) => return Exit::Disconnected(e.into()),
                    None => return Exit::Disconnected(BridgeError::Closed),
                };
                if let Err(e) = handle_upstream(ctx, peer, packet, pending).await {
                    return Exit::Disconnected(e);
                }
            },
        }
    }
}

async fn handle_upstream<S: Send + 'static>(
    ctx: &DeviceContext<S>,
    peer: &str,
    packet: Packet,
    pending: &mut VecDeque<PendingRequest>,
) -> Result<(), BridgeError> {
    if packet.uid_number() != ctx.uid().number() {
        return Ok(());
    }

    let debug = ctx.debug();
    let category = UpstreamCategory::from_sequence_number(packet.sequence_number());
    let function_id = packet.function_id();

    let (function, forward) = match ctx.table().upstream(category, function_id) {
        Some(spec) => {
            let function = format!("{}{{{}}}.{}", ctx.type_name(), ctx.uid(), spec.name);
            let values = match spec.format.unpack(packet.payload()) {
                Ok(values) => values,
                Err(source) => {
                    return Err(BridgeError::Unpack {
                        packet,
                        function,
                        category,
                        source,
                    });
                },
            };
            let filtered = AssertUnwindSafe((spec.handler)(ctx.clone(), Args::new(values)))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerError::Failed("filter panicked".to_string())));
            match filtered {
                Ok(forward) => (function, forward),
                Err(source) => {
                    return Err(BridgeError::Filter {
                        packet,
                        function,
                        category,
                        source,
                    });
                },
            }
        },
        None => {
            let function = format!("{}{{{}}}.<{function_id}>", ctx.type_name(), ctx.uid());
            let policy = &ctx.config().passthrough;
            let forward = match category {
                UpstreamCategory::Response => policy.unknown_responses,
                UpstreamCategory::Callback => policy.unknown_callbacks,
            };
            (function, forward)
        },
    };

    let kind = match category {
        UpstreamCategory::Response => MessageKind::Response,
        UpstreamCategory::Callback => MessageKind::Callback,
    };
    let message = Message {
        kind,
        source: Source::Passthrough(peer.to_string()),
        trace: ctx.next_trace(),
        packet,
    };

    if debug {
        debug!(%message, %function, %category, "Received from passthrough");
    }

    if !forward {
        if debug {
            debug!(%message, "Dropping");
        }
        return Ok(());
    }

    if category == UpstreamCategory::Callback {
        if debug {
            debug!(%message, "Forwarding");
        }
        ctx.broadcast(message);
        return Ok(());
    }

    let key = message.packet.request_match();
    match pending.iter().position(|p| p.key == key) {
        Some(index) => {
            if let Some(PendingRequest { request, sink, .. }) = pending.remove(index) {
                if debug {
                    debug!(%message, %request, "Forwarding expected response");
                }
                ctx.send_response(message, &sink);
            }
        },
        None => {
            if debug {
                debug!(%message, "Forwarding unexpected response");
            }
            ctx.broadcast(message);
        },
    }

    Ok(())
}
