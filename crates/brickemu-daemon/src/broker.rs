//! Request routing between clients and devices.
//!
//! The broker owns the device registry and the set of connected clients. It
//! runs as a single task that accepts connections and processes
//! [`BrokerEvent`]s in arrival order, so registry changes made while the
//! daemon runs take effect between two routing decisions, never during one.
//!
//! # Routing
//!
//! | UID       | Function ID | Destination                |
//! |-----------|-------------|----------------------------|
//! | 0         | 128         | dropped (disconnect probe) |
//! | 0         | any other   | every device, once each    |
//! | known     | any         | that device                |
//! | unknown   | any         | dropped                    |

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use brickemu_core::{Message, Uid};
use brickemu_core::packet::FUNCTION_DISCONNECT_PROBE;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capability::EnumerationType;
use crate::client::ClientConnection;
use crate::config::DaemonConfig;
use crate::daemon::{DaemonError, DaemonResult};
use crate::device::EmulatedDevice;
use crate::link::{DaemonLink, ResponseSink, TraceCounter};

/// Global counter for client connection IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Events processed by the broker task.
pub enum BrokerEvent {
    /// Register a device while the daemon runs.
    AddDevice {
        /// The device.
        device: Arc<dyn EmulatedDevice>,
        /// Completion.
        reply: oneshot::Sender<DaemonResult<()>>,
    },

    /// Unregister a device while the daemon runs.
    RemoveDevice {
        /// UID of the device.
        uid_number: u32,
        /// Instance that must be registered under the UID.
        instance_id: u64,
        /// Completion.
        reply: oneshot::Sender<DaemonResult<()>>,
    },

    /// A request from a client.
    Request {
        /// The request.
        request: Message,
        /// Where direct responses go.
        sink: ResponseSink,
    },

    /// A message for every connected client.
    Broadcast(Message),

    /// A client connection ended.
    ClientClosed(u64),
}

impl std::fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddDevice { device, .. } => f
                .debug_struct("AddDevice")
                .field("uid", &device.uid().as_str())
                .finish_non_exhaustive(),
            Self::RemoveDevice {
                uid_number,
                instance_id,
                ..
            } => f
                .debug_struct("RemoveDevice")
                .field("uid_number", uid_number)
                .field("instance_id", instance_id)
                .finish_non_exhaustive(),
            Self::Request { request, .. } => f.debug_tuple("Request").field(request).finish(),
            Self::Broadcast(message) => f.debug_tuple("Broadcast").field(message).finish(),
            Self::ClientClosed(id) => f.debug_tuple("ClientClosed").field(id).finish(),
        }
    }
}

struct DeviceSlot {
    device: Arc<dyn EmulatedDevice>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl DeviceSlot {
    fn start(&mut self, parent: &CancellationToken) {
        if self.task.is_some() {
            return;
        }
        let cancel = parent.child_token();
        let handle = tokio::spawn(self.device.run(cancel.clone()));
        self.task = Some((cancel, handle));
    }

    async fn stop(&mut self) {
        let Some((cancel, handle)) = self.task.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            error!(uid = %self.device.uid(), error = %e, "Device task failed");
        }
    }
}

/// Device registry and router.
pub struct Broker {
    config: DaemonConfig,
    devices: HashMap<u32, DeviceSlot>,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    traces: TraceCounter,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            devices: HashMap::new(),
            events_tx,
            events_rx,
            traces: TraceCounter::new(),
        }
    }

    /// Daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Number of registered devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<BrokerEvent> {
        self.events_tx.clone()
    }

    fn link(&self) -> DaemonLink {
        DaemonLink::new(
            self.events_tx.clone(),
            self.traces.clone(),
            self.config.debug,
            self.config.global_debug,
            self.config.broadcast_responses,
        )
    }

    /// Registers a device, announces it and starts it if `running` is set.
    pub(crate) fn add_device(
        &mut self,
        device: Arc<dyn EmulatedDevice>,
        running: Option<&CancellationToken>,
    ) -> DaemonResult<()> {
        let uid = device.uid().clone();
        if self.devices.contains_key(&uid.number()) {
            return Err(DaemonError::DuplicateDevice { uid });
        }

        device.attach(self.link());
        device.announce(EnumerationType::Connected);

        let mut slot = DeviceSlot { device, task: None };
        if let Some(parent) = running {
            slot.start(parent);
        }
        if self.config.debug_enabled() {
            debug!(
                %uid,
                device_type = slot.device.type_name(),
                instance_id = slot.device.instance_id(),
                "Device added"
            );
        }
        self.devices.insert(uid.number(), slot);
        Ok(())
    }

    /// Announces the removal of a device, stops it and unregisters it.
    pub(crate) async fn remove_device(&mut self, uid_number: u32, instance_id: u64) -> DaemonResult<()> {
        let Some(slot) = self.devices.get(&uid_number) else {
            return Err(DaemonError::DeviceNotFound {
                uid: Uid::from_number(uid_number),
            });
        };
        if slot.device.instance_id() != instance_id {
            return Err(DaemonError::DeviceMismatch {
                uid: slot.device.uid().clone(),
            });
        }

        let Some(mut slot) = self.devices.remove(&uid_number) else {
            return Ok(());
        };
        slot.device.announce(EnumerationType::Disconnected);
        slot.stop().await;
        slot.device.detach();

        if self.config.debug_enabled() {
            debug!(uid = %slot.device.uid(), instance_id, "Device removed");
        }
        Ok(())
    }

    /// Accepts clients and routes traffic until `cancel` fires, then stops
    /// every device and client and hands the broker back.
    pub(crate) async fn run(mut self, listener: TcpListener, cancel: CancellationToken) -> Self {
        let permits = Arc::new(Semaphore::new(self.config.max_clients));
        let mut clients: HashMap<u64, mpsc::UnboundedSender<Message>> = HashMap::new();
        let mut client_tasks = JoinSet::new();

        for slot in self.devices.values_mut() {
            slot.start(&cancel);
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event, &mut clients, &cancel).await;
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                            warn!(%peer, max_clients = self.config.max_clients, "Rejecting client, connection limit reached");
                            continue;
                        };
                        let id = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = mpsc::unbounded_channel();
                        clients.insert(id, tx.clone());
                        let connection = ClientConnection::new(
                            id,
                            peer,
                            stream,
                            rx,
                            ResponseSink::new(tx),
                            self.events_tx.clone(),
                            self.traces.clone(),
                            self.config.debug_enabled(),
                            permit,
                        );
                        client_tasks.spawn(connection.run(cancel.child_token()));
                    },
                    Err(e) => warn!(error = %e, "Failed to accept client"),
                },
                Some(_) = client_tasks.join_next(), if !client_tasks.is_empty() => {},
            }
        }

        while client_tasks.join_next().await.is_some() {}
        for slot in self.devices.values_mut() {
            slot.stop().await;
        }

        // stale client traffic must not leak into the next run
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                BrokerEvent::AddDevice { reply, .. } | BrokerEvent::RemoveDevice { reply, .. } => {
                    let _ = reply.send(Err(DaemonError::NotRunning));
                },
                BrokerEvent::Request { .. } | BrokerEvent::Broadcast(_) | BrokerEvent::ClientClosed(_) => {},
            }
        }

        info!("Daemon stopped");
        self
    }

    async fn handle_event(
        &mut self,
        event: BrokerEvent,
        clients: &mut HashMap<u64, mpsc::UnboundedSender<Message>>,
        cancel: &CancellationToken,
    ) {
        match event {
            BrokerEvent::AddDevice { device, reply } => {
                let _ = reply.send(self.add_device(device, Some(cancel)));
            },
            BrokerEvent::RemoveDevice {
                uid_number,
                instance_id,
                reply,
            } => {
                let _ = reply.send(self.remove_device(uid_number, instance_id).await);
            },
            BrokerEvent::Request { request, sink } => self.route(request, &sink),
            BrokerEvent::Broadcast(message) => {
                if self.config.debug_enabled() {
                    debug!(%message, clients = clients.len(), "Broadcasting");
                }
                for tx in clients.values() {
                    let _ = tx.send(message.clone());
                }
            },
            BrokerEvent::ClientClosed(id) => {
                clients.remove(&id);
            },
        }
    }

    fn route(&self, request: Message, sink: &ResponseSink) {
        let uid_number = request.packet.uid_number();

        if uid_number == 0 {
            if request.packet.function_id() == FUNCTION_DISCONNECT_PROBE {
                if self.config.debug_enabled() {
                    debug!(%request, "Dropping disconnect probe");
                }
                return;
            }
            for slot in self.devices.values() {
                slot.device.enqueue_request(request.clone(), sink.clone());
            }
            return;
        }

        match self.devices.get(&uid_number) {
            Some(slot) => slot.device.enqueue_request(request, sink.clone()),
            None => {
                if self.config.debug_enabled() {
                    warn!(%request, "Dropping request for unknown UID");
                }
            },
        }
    }
}

pub(crate) async fn bind(addr: &str) -> DaemonResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| DaemonError::Bind {
        addr: addr.to_string(),
        source,
    })
}

