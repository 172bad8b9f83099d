//! Device runtime.
//!
//! A [`Device`] is one emulated Brick or Bricklet: a UID, a shared
//! [`FunctionTable`], the type-specific state `S`, and the state of its
//! built-in capabilities. While the daemon runs, the device runs three kinds
//! of work concurrently:
//!
//! - the request loop, dispatching queued requests one at a time in FIFO
//!   order
//! - the passthrough bridge, if an upstream target is configured (see
//!   [`passthrough`](crate::passthrough))
//! - the autorun tasks registered with the table
//!
//! # Dispatch
//!
//! 1. Resolve the handler: local function, request-passthrough filter, or
//!    unknown (forwarded or not-supported per [`PassthroughPolicy`]).
//! 2. Unpack the payload. On failure answer invalid-parameter, or drop the
//!    request if no response is expected.
//! 3. Run the handler and map its [`Outcome`].
//! 4. Pack the outputs. Arity or type mismatches answer invalid-parameter,
//!    never malformed bytes.
//!
//! A device never touches a socket. Responses go to the requester's
//! [`ResponseSink`]; callbacks go through the [`DaemonLink`].
//!
//! [`PassthroughPolicy`]: crate::config::PassthroughPolicy

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use brickemu_core::packet::CALLBACK_ENUMERATE;
use brickemu_core::{
    CodecError, ErrorCode, Format, Message, MessageKind, Packet, ProtocolError, Source, Uid, Value,
};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::capability::{self, BootloaderState, Capabilities, EnumerationType};
use crate::config::{DeviceConfig, Identity, IdentityError, resolve_debug};
use crate::handler::{Args, HandlerError, HandlerResult, Outcome};
use crate::link::{DaemonLink, ResponseSink};
use crate::passthrough;
use crate::table::{FunctionTable, RequestEntry};

/// Global counter distinguishing device instances that share a UID.
static INSTANCE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

static EMPTY_FORMAT: Format = Format::empty();

/// Errors raised by device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// UID 0 is the broadcast address.
    #[error("UID {uid} is the broadcast UID")]
    BroadcastUid {
        /// The rejected UID.
        uid: Uid,
    },

    /// Callback values do not match the callback format.
    #[error("error while packing {name} callback: {source}")]
    CallbackPacking {
        /// Callback name.
        name: String,
        /// Codec error.
        #[source]
        source: CodecError,
    },

    /// The packed callback does not fit into a packet.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The identity cannot be encoded.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Request queued for a device together with the requester's sink.
pub(crate) type QueuedRequest = (Message, ResponseSink);

/// An unbounded queue whose receiver can be borrowed by successive runs.
struct Queue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }
}

struct Shared<S> {
    instance_id: u64,
    config: DeviceConfig,
    table: Arc<FunctionTable<S>>,
    state: AsyncMutex<S>,
    identity: Mutex<Identity>,
    bootloader: Mutex<BootloaderState>,
    link: Mutex<Option<DaemonLink>>,
    requests: Queue<QueuedRequest>,
    passthrough: Queue<QueuedRequest>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of dispatching one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Send this packet to the requester.
    Respond(Packet),
    /// Send nothing.
    Silent,
    /// Hand the request to the passthrough bridge.
    Passthrough,
}

/// Handle given to handlers and autorun tasks.
pub struct DeviceContext<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for DeviceContext<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> fmt::Debug for DeviceContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("type_name", &self.type_name())
            .field("uid", &self.uid().as_str())
            .field("instance_id", &self.instance_id())
            .finish_non_exhaustive()
    }
}

impl<S> DeviceContext<S> {
    /// Device UID.
    #[must_use]
    pub fn uid(&self) -> &Uid {
        &self.shared.config.uid
    }

    /// Unique instance ID.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    /// Device type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.shared.table.type_name()
    }

    /// Device configuration.
    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Locks the type-specific state.
    pub async fn state(&self) -> AsyncMutexGuard<'_, S> {
        self.shared.state.lock().await
    }

    /// Current identity.
    #[must_use]
    pub fn identity(&self) -> Identity {
        lock(&self.shared.identity).clone()
    }

    /// Replaces the identity reported from now on.
    ///
    /// # Errors
    ///
    /// Returns an error and keeps the current identity if `identity` cannot
    /// be encoded.
    pub fn set_identity(&self, identity: Identity) -> Result<(), DeviceError> {
        identity.validate()?;
        *lock(&self.shared.identity) = identity;
        Ok(())
    }

    /// Current bootloader state.
    #[must_use]
    pub fn bootloader(&self) -> BootloaderState {
        *lock(&self.shared.bootloader)
    }

    /// Mutates the bootloader state.
    pub fn update_bootloader<R>(&self, f: impl FnOnce(&mut BootloaderState) -> R) -> R {
        f(&mut lock(&self.shared.bootloader))
    }

    /// Returns `true` while the device is added to a daemon.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        lock(&self.shared.link).is_some()
    }

    /// Effective debug flag.
    #[must_use]
    pub fn debug(&self) -> bool {
        let device = self.shared.config.debug;
        match &*lock(&self.shared.link) {
            Some(link) => link.debug(device),
            None => resolve_debug(device, None, false),
        }
    }

    fn link(&self) -> Option<DaemonLink> {
        lock(&self.shared.link).clone()
    }

    fn signature(&self, name: &str) -> String {
        format!("{}{{{}}}.{}", self.type_name(), self.uid(), name)
    }

    /// Packs and broadcasts a callback from this device.
    ///
    /// A device that is not added to a daemon drops the callback.
    ///
    /// # Errors
    ///
    /// Returns an error if `values` do not match `format` or the payload does
    /// not fit into a packet.
    pub fn emit_callback(
        &self,
        callback_id: u8,
        name: &str,
        format: &Format,
        values: &[Value],
    ) -> Result<(), DeviceError> {
        let payload = format.pack(values).map_err(|source| DeviceError::CallbackPacking {
            name: self.signature(name),
            source,
        })?;
        let packet = Packet::callback(self.uid().number(), callback_id, &payload)?;

        let Some(link) = self.link() else {
            if self.debug() {
                warn!(
                    callback = %self.signature(name),
                    "Dropping callback, device not added to a daemon"
                );
            }
            return Ok(());
        };

        let message = Message::new(MessageKind::Callback, Source::Emulator, packet)
            .with_trace(link.next_trace());
        link.broadcast(message);
        Ok(())
    }

    /// Emits an enumeration callback if the enumerate capability is installed.
    pub fn announce(&self, kind: EnumerationType) {
        if !self.shared.table.capabilities().enumerate {
            return;
        }

        let values = capability::enumeration_values(self.uid(), &self.identity(), kind);
        let result = capability::enumerate_callback_format()
            .map_err(|source| DeviceError::CallbackPacking {
                name: self.signature("enumerate"),
                source,
            })
            .and_then(|format| self.emit_callback(CALLBACK_ENUMERATE, "enumerate", &format, &values));

        if let Err(e) = result {
            error!(uid = %self.uid(), error = %e, "Failed to emit enumeration callback");
        }
    }

    pub(crate) fn next_trace(&self) -> Option<u64> {
        self.link().map(|link| link.next_trace())
    }

    pub(crate) fn broadcast(&self, message: Message) {
        match self.link() {
            Some(link) => link.broadcast(message),
            None => {
                if self.debug() {
                    warn!(uid = %self.uid(), %message, "Dropping message to be broadcast, device not added to a daemon");
                }
            },
        }
    }

    /// Delivers a response to its requester, or to every client if the
    /// daemon broadcasts responses.
    pub(crate) fn send_response(&self, message: Message, sink: &ResponseSink) {
        if self.link().is_some_and(|link| link.broadcast_responses()) {
            self.broadcast(message);
            return;
        }
        if !sink.send(message) && self.debug() {
            debug!(uid = %self.uid(), "Dropping response, client disconnected");
        }
    }

    pub(crate) async fn passthrough_queue(&self) -> AsyncMutexGuard<'_, mpsc::UnboundedReceiver<QueuedRequest>> {
        self.shared.passthrough.rx.lock().await
    }

    pub(crate) fn table(&self) -> &FunctionTable<S> {
        &self.shared.table
    }
}

impl<S: Send + 'static> DeviceContext<S> {
    /// Dispatches one request.
    pub(crate) async fn dispatch(&self, request: &Message) -> Dispatch {
        let packet = &request.packet;
        let function_id = packet.function_id();
        let response_expected = packet.response_expected();
        let debug = self.debug();

        let entry = self.table().request(function_id);
        let signature = match entry {
            Some(entry) => self.signature(entry.name()),
            None => self.signature(&format!("<{function_id}>")),
        };

        if debug {
            debug!(
                %request,
                function = %signature,
                response_expected,
                "Handling request"
            );
        }

        let input = match entry {
            Some(RequestEntry::Function(spec)) => Some(&spec.input),
            Some(RequestEntry::Passthrough(spec)) => Some(&spec.format),
            None => None,
        };
        let args = match input.map(|format| format.unpack(packet.payload())) {
            None => Args::default(),
            Some(Ok(values)) => Args::new(values),
            Some(Err(e)) => {
                if debug {
                    error!(
                        %request,
                        function = %signature,
                        format = %input.unwrap_or(&EMPTY_FORMAT),
                        error = %e,
                        "Failed to unpack request"
                    );
                }
                return if response_expected {
                    Dispatch::Respond(packet.error_response(ErrorCode::InvalidParameter))
                } else {
                    Dispatch::Silent
                };
            },
        };

        let handler = match entry {
            Some(RequestEntry::Function(spec)) => (spec.handler)(self.clone(), args),
            Some(RequestEntry::Passthrough(spec)) => (spec.handler)(self.clone(), args)
                .map(|forward| {
                    forward.map(|forward| {
                        if forward {
                            Outcome::Passthrough
                        } else {
                            Outcome::NoResponse
                        }
                    })
                })
                .boxed(),
            None if self.config().passthrough.unknown_requests => {
                future::ready(Ok(Outcome::Passthrough)).boxed()
            },
            None => future::ready(Ok(Outcome::NoSupport)).boxed(),
        };
        // a panicking handler must not take the request loop down with it
        let outcome: HandlerResult<Outcome> = AssertUnwindSafe(handler)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::Failed("handler panicked".to_string())));

        let values = match outcome {
            Ok(Outcome::Return(values)) => Some(values),
            Ok(Outcome::Done) => None,
            Ok(Outcome::NoResponse) => {
                if debug {
                    debug!(%request, function = %signature, "No-response selected");
                }
                return Dispatch::Silent;
            },
            Ok(Outcome::NoSupport) => {
                if debug {
                    debug!(%request, function = %signature, "No-support selected");
                }
                return if response_expected {
                    Dispatch::Respond(packet.error_response(ErrorCode::FunctionNotSupported))
                } else {
                    Dispatch::Silent
                };
            },
            Ok(Outcome::Passthrough) => {
                if self.config().upstream.is_some() {
                    if debug {
                        debug!(%request, function = %signature, "Passthrough selected");
                    }
                    return Dispatch::Passthrough;
                }
                if debug {
                    warn!(
                        %request,
                        function = %signature,
                        "Passthrough selected, but passthrough not configured"
                    );
                }
                return if response_expected {
                    Dispatch::Respond(packet.error_response(ErrorCode::FunctionNotSupported))
                } else {
                    Dispatch::Silent
                };
            },
            Err(e) => {
                if debug {
                    error!(%request, function = %signature, error = %e, "Handler failed");
                }
                return if response_expected {
                    Dispatch::Respond(packet.error_response(ErrorCode::InvalidParameter))
                } else {
                    Dispatch::Silent
                };
            },
        };

        if !response_expected {
            if debug && values.as_ref().is_some_and(|v| !v.is_empty()) {
                warn!(%request, function = %signature, "Dropping output, no response expected");
            }
            return Dispatch::Silent;
        }

        let output = match entry {
            Some(RequestEntry::Function(spec)) => &spec.output,
            _ => &EMPTY_FORMAT,
        };

        let payload = if output.is_empty() {
            if debug && values.as_ref().is_some_and(|v| !v.is_empty()) {
                warn!(%request, function = %signature, "Dropping unexpected output");
            }
            Vec::new()
        } else {
            let Some(values) = values else {
                if debug {
                    warn!(%request, function = %signature, "Missing expected output");
                }
                return Dispatch::Respond(packet.error_response(ErrorCode::InvalidParameter));
            };
            match output.pack(&values) {
                Ok(payload) => payload,
                Err(e) => {
                    if debug {
                        error!(
                            %request,
                            function = %signature,
                            format = %output,
                            error = %e,
                            "Failed to pack output"
                        );
                    }
                    return Dispatch::Respond(packet.error_response(ErrorCode::InvalidParameter));
                },
            }
        };

        match packet.response_with_payload(&payload) {
            Ok(response) => Dispatch::Respond(response),
            Err(e) => {
                if debug {
                    error!(%request, function = %signature, error = %e, "Failed to build response");
                }
                Dispatch::Respond(packet.error_response(ErrorCode::InvalidParameter))
            },
        }
    }

    /// Runs the device until `cancel` fires.
    async fn run(self, cancel: CancellationToken) {
        let autoruns = self
            .table()
            .autoruns()
            .iter()
            .map(|spec| {
                let task = (spec.handler)(self.clone());
                let name = spec.name.clone();
                let signature = self.signature(&name);
                let debug = self.debug();
                async move {
                    if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                        error!(autorun = %signature, "Autorun task panicked");
                    } else if debug {
                        debug!(autorun = %signature, "Autorun task finished");
                    }
                }
            })
            .collect::<Vec<_>>();

        let autoruns = async {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {},
                _ = future::join_all(autoruns) => cancel.cancelled().await,
            }
        };

        tokio::join!(
            self.clone().request_loop(cancel.clone()),
            passthrough::run_bridge(self.clone(), cancel.clone()),
            autoruns,
        );
    }

    async fn request_loop(self, cancel: CancellationToken) {
        let mut queue = self.shared.requests.rx.lock().await;

        loop {
            let (request, sink) = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let dispatch = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                dispatch = self.dispatch(&request) => dispatch,
            };

            match dispatch {
                Dispatch::Respond(packet) => {
                    let response = request.reply(Source::Emulator, packet);
                    if self.debug() {
                        debug!(%response, "Sending response");
                    }
                    self.send_response(response, &sink);
                },
                Dispatch::Silent => {},
                Dispatch::Passthrough => {
                    // the bridge owns the receiver for as long as the device runs
                    let _ = self.shared.passthrough.tx.send((request, sink));
                },
            }
        }
    }
}

/// Object-safe interface the daemon uses to drive devices of any type.
pub trait EmulatedDevice: Send + Sync + 'static {
    /// Device UID.
    fn uid(&self) -> &Uid;

    /// Unique instance ID.
    fn instance_id(&self) -> u64;

    /// Device type name.
    fn type_name(&self) -> &str;

    /// Installed capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Connects the device to a daemon.
    fn attach(&self, link: DaemonLink);

    /// Disconnects the device from its daemon.
    fn detach(&self);

    /// Queues a request for dispatch.
    fn enqueue_request(&self, request: Message, sink: ResponseSink);

    /// Emits an enumeration callback (no-op without the enumerate capability).
    fn announce(&self, kind: EnumerationType);

    /// Returns the device's main loop. It completes after `cancel` fires.
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'static, ()>;
}

/// An emulated device with type-specific state `S`.
pub struct Device<S> {
    context: DeviceContext<S>,
}

impl<S> Clone for Device<S> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<S> fmt::Debug for Device<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Device").field(&self.context).finish()
    }
}

impl<S: Send + 'static> Device<S> {
    /// Creates a device of the type described by `table`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::BroadcastUid`] for UID 0 and
    /// [`DeviceError::Identity`] for an identity that cannot be encoded.
    pub fn new(config: DeviceConfig, table: Arc<FunctionTable<S>>, state: S) -> Result<Self, DeviceError> {
        if config.uid.is_broadcast() {
            return Err(DeviceError::BroadcastUid { uid: config.uid });
        }
        config.identity.validate()?;

        let shared = Shared {
            instance_id: INSTANCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            identity: Mutex::new(config.identity.clone()),
            config,
            table,
            state: AsyncMutex::new(state),
            bootloader: Mutex::new(BootloaderState::default()),
            link: Mutex::new(None),
            requests: Queue::new(),
            passthrough: Queue::new(),
        };

        Ok(Self {
            context: DeviceContext {
                shared: Arc::new(shared),
            },
        })
    }

    /// Handler-facing context of this device.
    #[must_use]
    pub fn context(&self) -> &DeviceContext<S> {
        &self.context
    }
}

impl<S: Send + 'static> EmulatedDevice for Device<S> {
    fn uid(&self) -> &Uid {
        self.context.uid()
    }

    fn instance_id(&self) -> u64 {
        self.context.instance_id()
    }

    fn type_name(&self) -> &str {
        self.context.type_name()
    }

    fn capabilities(&self) -> Capabilities {
        self.context.table().capabilities()
    }

    fn attach(&self, link: DaemonLink) {
        *lock(&self.context.shared.link) = Some(link);
    }

    fn detach(&self) {
        *lock(&self.context.shared.link) = None;
    }

    fn enqueue_request(&self, request: Message, sink: ResponseSink) {
        // the receiver lives as long as the device
        let _ = self.context.shared.requests.tx.send((request, sink));
    }

    fn announce(&self, kind: EnumerationType) {
        self.context.announce(kind);
    }

    fn run(&self, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        self.context.clone().run(cancel).boxed()
    }
}
