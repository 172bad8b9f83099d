//! Integration tests for the passthrough bridge against a fake upstream
//! daemon.
//!
//! Test command: `cargo test -p brickemu-daemon --test passthrough_bridge`

mod common;

use std::sync::Arc;
use std::time::Duration;

use brickemu_core::packet::FUNCTION_GET_IDENTITY;
use brickemu_core::{Packet, Uid};
use brickemu_daemon::{
    Args, BrickDaemon, DeviceConfig, Device, DeviceContext, FunctionTable, HandlerResult,
    PassthroughPolicy, UpstreamTarget,
};
use futures::SinkExt;
use common::{
    Counter, FakeUpstream, TestClient, counter_table, expect_upstream_closed, local_config,
    next_packet,
};

const FORWARDED_FUNCTION: u8 = 50;

fn bridged_config(uid: &str, upstream: &FakeUpstream, policy: PassthroughPolicy) -> DeviceConfig {
    DeviceConfig::new(Uid::parse(uid).unwrap())
        .with_debug(true)
        .with_upstream(UpstreamTarget::new("127.0.0.1", upstream.port()))
        .with_passthrough_policy(policy)
        .with_retry_interval(Duration::from_millis(100))
}

async fn registered_client(addr: std::net::SocketAddr, uid: &str) -> TestClient {
    let mut client = TestClient::connect(addr).await;
    client.request(uid, FUNCTION_GET_IDENTITY, 15, &[]).await;
    client.recv().await;
    client
}

#[tokio::test]
async fn responses_are_correlated_to_their_requesters() {
    let upstream = FakeUpstream::bind().await;
    let config = bridged_config("prx", &upstream, PassthroughPolicy::forward_all());
    let device = Device::new(config, counter_table(), Counter::default()).unwrap();

    let mut daemon = BrickDaemon::new(local_config());
    daemon.add_device(device).await.unwrap();
    let addr = daemon.start().await.unwrap();
    let mut bridge = upstream.accept().await;

    let mut first = registered_client(addr, "prx").await;
    let mut second = registered_client(addr, "prx").await;

    first.request("prx", FORWARDED_FUNCTION, 1, &[]).await;
    let first_request = next_packet(&mut bridge).await;
    second.request("prx", FORWARDED_FUNCTION, 2, &[]).await;
    let second_request = next_packet(&mut bridge).await;
    assert_eq!(first_request.sequence_number(), 1);
    assert_eq!(second_request.sequence_number(), 2);

    // answer in reverse order
    bridge
        .send(second_request.response_with_payload(&[2]).unwrap())
        .await
        .unwrap();
    bridge
        .send(first_request.response_with_payload(&[1]).unwrap())
        .await
        .unwrap();

    let response = first.recv().await;
    assert_eq!(response.sequence_number(), 1);
    assert_eq!(response.payload(), [1]);
    let response = second.recv().await;
    assert_eq!(response.sequence_number(), 2);
    assert_eq!(response.payload(), [2]);
    first.expect_silence().await;
    second.expect_silence().await;

    let uid = Uid::parse("prx").unwrap().number();
    bridge.send(Packet::callback(uid, 60, &[7]).unwrap()).await.unwrap();
    for client in [&mut first, &mut second] {
        let callback = client.recv().await;
        assert_eq!(callback.function_id(), 60);
        assert_eq!(callback.payload(), [7]);
    }

    // no pending request left, so this one is broadcast
    bridge
        .send(first_request.response_with_payload(&[9]).unwrap())
        .await
        .unwrap();
    assert_eq!(first.recv().await.payload(), [9]);
    assert_eq!(second.recv().await.payload(), [9]);

    let other = Uid::parse("zzz").unwrap().number();
    bridge.send(Packet::callback(other, 60, &[7]).unwrap()).await.unwrap();
    first.expect_silence().await;
}

#[tokio::test]
async fn bridge_reconnects_after_upstream_disconnect() {
    let upstream = FakeUpstream::bind().await;
    let config = bridged_config("prx", &upstream, PassthroughPolicy::forward_all());
    let device = Device::new(config, counter_table(), Counter::default()).unwrap();

    let mut daemon = BrickDaemon::new(local_config());
    daemon.add_device(device).await.unwrap();
    let addr = daemon.start().await.unwrap();

    let bridge = upstream.accept().await;
    drop(bridge);
    let mut bridge = upstream.accept().await;

    let mut client = TestClient::connect(addr).await;
    client.request("prx", FORWARDED_FUNCTION, 4, &[]).await;
    let request = next_packet(&mut bridge).await;
    bridge.send(request.response_with_payload(&[]).unwrap()).await.unwrap();
    assert_eq!(client.recv().await.sequence_number(), 4);
}

#[tokio::test]
async fn pending_requests_are_abandoned_on_disconnect() {
    let upstream = FakeUpstream::bind().await;
    let config = bridged_config("prx", &upstream, PassthroughPolicy::forward_all());
    let device = Device::new(config, counter_table(), Counter::default()).unwrap();

    let mut daemon = BrickDaemon::new(local_config());
    daemon.add_device(device).await.unwrap();
    let addr = daemon.start().await.unwrap();
    let mut bridge = upstream.accept().await;

    let mut first = registered_client(addr, "prx").await;
    let mut second = registered_client(addr, "prx").await;

    first.request("prx", FORWARDED_FUNCTION, 3, &[]).await;
    let request = next_packet(&mut bridge).await;
    drop(bridge);
    let mut bridge = upstream.accept().await;

    // the requester is forgotten, so a late answer is unexpected and broadcast
    bridge
        .send(request.response_with_payload(&[3]).unwrap())
        .await
        .unwrap();
    assert_eq!(first.recv().await.payload(), [3]);
    assert_eq!(second.recv().await.payload(), [3]);
    first.expect_silence().await;
}

#[tokio::test]
async fn unknown_function_without_forwarding_is_not_supported() {
    let upstream = FakeUpstream::bind().await;
    let config = bridged_config("prx", &upstream, PassthroughPolicy::default());
    let device = Device::new(config, counter_table(), Counter::default()).unwrap();

    let mut daemon = BrickDaemon::new(local_config());
    daemon.add_device(device).await.unwrap();
    let addr = daemon.start().await.unwrap();

    let mut client = TestClient::connect(addr).await;
    client.request("prx", FORWARDED_FUNCTION, 1, &[]).await;
    assert_eq!(
        client.recv().await.error_code(),
        brickemu_core::ErrorCode::FunctionNotSupported
    );
}

async fn forward_nonzero(_ctx: DeviceContext<()>, args: Args) -> HandlerResult<bool> {
    Ok(args.get::<u8>(0)? != 0)
}

async fn forward_always(_ctx: DeviceContext<()>, _args: Args) -> HandlerResult<bool> {
    Ok(true)
}

async fn forward_above_threshold(_ctx: DeviceContext<()>, args: Args) -> HandlerResult<bool> {
    Ok(args.get::<u16>(0)? > 100)
}

fn filtered_table() -> Arc<FunctionTable<()>> {
    Arc::new(
        FunctionTable::builder("FilteredBricklet")
            .passthrough_request(10, "get_remote", "B", forward_nonzero)
            .passthrough_response(10, "get_remote", "B", forward_always)
            .passthrough_callback(11, "remote_reached", "H", forward_above_threshold)
            .with_enumerate()
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn filters_decide_what_crosses_the_bridge() {
    let table = filtered_table();

    let upstream = FakeUpstream::bind().await;
    let config = bridged_config("flt", &upstream, PassthroughPolicy::default());
    let device = Device::new(config, table, ()).unwrap();

    let mut daemon = BrickDaemon::new(local_config());
    daemon.add_device(device).await.unwrap();
    let addr = daemon.start().await.unwrap();
    let mut bridge = upstream.accept().await;
    let mut client = registered_client(addr, "flt").await;

    client.request("flt", 10, 1, &[0]).await;
    client.expect_silence().await;

    client.request("flt", 10, 2, &[1]).await;
    let request = next_packet(&mut bridge).await;
    assert_eq!(request.sequence_number(), 2);
    assert_eq!(request.payload(), [1]);
    bridge.send(request.response_with_payload(&[5]).unwrap()).await.unwrap();
    assert_eq!(client.recv().await.payload(), [5]);

    let uid = Uid::parse("flt").unwrap().number();
    bridge
        .send(Packet::callback(uid, 11, &50u16.to_le_bytes()).unwrap())
        .await
        .unwrap();
    bridge
        .send(Packet::callback(uid, 12, &[1]).unwrap())
        .await
        .unwrap();
    bridge
        .send(Packet::callback(uid, 11, &150u16.to_le_bytes()).unwrap())
        .await
        .unwrap();

    let callback = client.recv().await;
    assert_eq!(callback.function_id(), 11);
    assert_eq!(callback.payload(), 150u16.to_le_bytes());
    client.expect_silence().await;
}

#[tokio::test]
async fn malformed_filtered_packet_drops_the_upstream_connection() {
    let upstream = FakeUpstream::bind().await;
    let config = bridged_config("flt", &upstream, PassthroughPolicy::default());
    let device = Device::new(config, filtered_table(), ()).unwrap();

    let mut daemon = BrickDaemon::new(local_config());
    daemon.add_device(device).await.unwrap();
    let addr = daemon.start().await.unwrap();
    let mut bridge = upstream.accept().await;
    let mut client = registered_client(addr, "flt").await;

    // remote_reached carries a u16, one byte cannot be unpacked
    let uid = Uid::parse("flt").unwrap().number();
    bridge.send(Packet::callback(uid, 11, &[1]).unwrap()).await.unwrap();
    expect_upstream_closed(&mut bridge).await;
    client.expect_silence().await;

    let mut bridge = upstream.accept().await;
    bridge
        .send(Packet::callback(uid, 11, &150u16.to_le_bytes()).unwrap())
        .await
        .unwrap();
    let callback = client.recv().await;
    assert_eq!(callback.function_id(), 11);
    assert_eq!(callback.payload(), 150u16.to_le_bytes());
}
