//! Common test utilities for daemon integration tests.
//!
//! Every daemon and fake upstream binds `127.0.0.1:0`, so tests can run in
//! parallel without port conflicts.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use brickemu_core::{FramePolicy, Packet, PacketCodec, Uid};
use brickemu_daemon::{
    Args, BrickDaemon, DaemonConfig, Device, DeviceConfig, DeviceContext, FunctionTable,
    HandlerResult, Identity, Outcome,
};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// How long a test waits to conclude that nothing arrives.
pub const SILENCE: Duration = Duration::from_millis(300);

/// Device identifier reported by [`counter_device`].
pub const COUNTER_DEVICE_IDENTIFIER: u16 = 4242;

/// State of the counter test device.
#[derive(Debug, Default)]
pub struct Counter {
    pub value: u32,
}

async fn get_value(ctx: DeviceContext<Counter>, _args: Args) -> HandlerResult<Outcome> {
    Ok(Outcome::value(ctx.state().await.value))
}

async fn set_value(ctx: DeviceContext<Counter>, args: Args) -> HandlerResult<Outcome> {
    ctx.state().await.value = args.get(0)?;
    Ok(Outcome::Done)
}

/// Table of the counter test device: 1 get (`I`), 2 set (`I`).
pub fn counter_table() -> Arc<FunctionTable<Counter>> {
    Arc::new(
        FunctionTable::builder("CounterBricklet")
            .function(1, "get_value", "", "I", get_value)
            .function(2, "set_value", "I", "", set_value)
            .with_enumerate()
            .with_bootloader()
            .build()
            .unwrap(),
    )
}

/// Creates a counter device with the given UID.
pub fn counter_device(uid: &str) -> Device<Counter> {
    let config = DeviceConfig::new(Uid::parse(uid).unwrap())
        .with_identity(Identity::new(COUNTER_DEVICE_IDENTIFIER));
    Device::new(config, counter_table(), Counter::default()).unwrap()
}

/// Starts a daemon on an ephemeral port with the given devices.
pub async fn start_daemon(
    config: DaemonConfig,
    devices: Vec<Device<Counter>>,
) -> (BrickDaemon, SocketAddr) {
    let mut daemon = BrickDaemon::new(config.with_global_debug(true));
    for device in devices {
        daemon.add_device(device).await.unwrap();
    }
    let addr = daemon.start().await.unwrap();
    (daemon, addr)
}

/// Default daemon config on an ephemeral port.
pub fn local_config() -> DaemonConfig {
    DaemonConfig::new("127.0.0.1:0")
}

/// A raw protocol client.
pub struct TestClient {
    framed: Framed<TcpStream, PacketCodec>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::time::timeout(TIMEOUT, TcpStream::connect(addr))
            .await
            .unwrap()
            .unwrap();
        Self {
            framed: Framed::new(stream, PacketCodec::new(FramePolicy::Any)),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.framed.send(packet).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    /// Sends a request and returns it.
    pub async fn request(
        &mut self,
        uid: &str,
        function_id: u8,
        sequence_number: u8,
        payload: &[u8],
    ) -> Packet {
        let uid = Uid::parse(uid).unwrap();
        let packet = Packet::new(uid.number(), function_id, sequence_number, true, payload).unwrap();
        self.send(packet.clone()).await;
        packet
    }

    /// Next packet from the daemon.
    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a packet")
            .expect("connection closed")
            .expect("framing error")
    }

    /// Asserts that nothing arrives for [`SILENCE`].
    pub async fn expect_silence(&mut self) {
        if let Ok(frame) = tokio::time::timeout(SILENCE, self.framed.next()).await {
            panic!("expected silence, got {frame:?}");
        }
    }

    /// Waits until the daemon closes the connection.
    pub async fn expect_closed(&mut self) {
        let frame = tokio::time::timeout(TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for close");
        assert!(
            !matches!(frame, Some(Ok(_))),
            "expected close, got {frame:?}"
        );
    }
}

/// A fake upstream daemon accepting a single bridge connection.
pub struct FakeUpstream {
    listener: TcpListener,
}

impl FakeUpstream {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accepts the bridge connection of a device.
    pub async fn accept(&self) -> Framed<TcpStream, PacketCodec> {
        let (stream, _) = tokio::time::timeout(TIMEOUT, self.listener.accept())
            .await
            .unwrap()
            .unwrap();
        Framed::new(stream, PacketCodec::new(FramePolicy::Any))
    }
}

/// Reads the next packet from a framed fake-upstream connection.
pub async fn next_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Packet {
    tokio::time::timeout(TIMEOUT, framed.next())
        .await
        .expect("timed out waiting for a packet")
        .expect("connection closed")
        .expect("framing error")
}

/// Waits until the bridge on the other end closes a fake-upstream connection.
pub async fn expect_upstream_closed(framed: &mut Framed<TcpStream, PacketCodec>) {
    let frame = tokio::time::timeout(TIMEOUT, framed.next())
        .await
        .expect("timed out waiting for close");
    assert!(!matches!(frame, Some(Ok(_))), "expected close, got {frame:?}");
}
