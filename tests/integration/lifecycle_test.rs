//! Connection lifecycle: coalescing, idempotent close, endpoint errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use interbus::broker::Broker;
use interbus::client::BusClient;
use interbus::codec::JsonCodec;
use interbus::command::ProcessKind;
use interbus::config::{CloseOptions, ConnectOptions};
use interbus::connector::SocketConnector;
use interbus::error::BusError;
use interbus::transport::{BusContext, Transport};

use crate::common;

#[tokio::test]
async fn test_concurrent_connects_coalesce() {
    let bus = common::start_broker().await;

    let codec = Arc::new(JsonCodec);
    let connector = Arc::new(SocketConnector::new(ProcessKind::Node, codec.clone()));
    let transport = Transport::new(BusContext::new(ProcessKind::Node), connector, codec);

    let first = {
        let transport = transport.clone();
        let options = bus.options.clone();
        tokio::spawn(async move { transport.connect(&options).await })
    };
    let second = {
        let transport = transport.clone();
        let options = bus.options.clone();
        tokio::spawn(async move { transport.connect(&options).await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(transport.is_connected());

    // One link at the broker, not two.
    let client = BusClient::attach(transport.clone(), None);
    client.on("probe", |_, _| {});
    common::wait_for_channel(&bus.broker, "probe").await;
    let snapshot = bus.broker.query_state().await.unwrap();
    assert_eq!(snapshot.peers.len(), 1);
}

#[tokio::test]
async fn test_close_deadline_forces_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hold.sock");
    // A server that accepts but never closes its side, so the graceful
    // close never sees EOF.
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let held = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let codec = Arc::new(JsonCodec);
    let connector = Arc::new(SocketConnector::new(ProcessKind::Node, codec.clone()));
    let transport = Transport::new(BusContext::new(ProcessKind::Node), connector, codec);
    transport
        .connect(&ConnectOptions::default().with_path(&path))
        .await
        .unwrap();

    let started = Instant::now();
    transport
        .close(&CloseOptions::default().with_timeout(100))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!transport.is_connected());
    held.abort();
}

#[tokio::test]
async fn test_reconnect_survives_prior_link_teardown() {
    let bus = common::start_broker().await;
    let transport = common::connect_transport(&bus.options).await;

    transport.close(&CloseOptions::default()).await.unwrap();
    transport.connect(&bus.options).await.unwrap();
    // Anything left over from the first link must not tear down the second.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.is_connected());

    let client = BusClient::attach(transport.clone(), None);
    client.on("again", |_, _| {});
    common::wait_for_channel(&bus.broker, "again").await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let bus = common::start_broker().await;
    let transport = common::connect_transport(&bus.options).await;

    transport.close(&CloseOptions::default()).await.unwrap();
    transport.close(&CloseOptions::default()).await.unwrap();
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_endpoint_validation() {
    let neither = BusClient::connect(&ConnectOptions::default()).await;
    assert!(matches!(neither.unwrap_err(), BusError::Options(_)));

    let both = BusClient::connect(
        &ConnectOptions::default()
            .with_path("/tmp/nowhere.sock")
            .with_port(9),
    )
    .await;
    assert!(matches!(both.unwrap_err(), BusError::Options(_)));
}

#[tokio::test]
async fn test_connect_to_missing_broker_fails() {
    let dir = tempfile::tempdir().unwrap();
    let options = ConnectOptions::default()
        .with_path(dir.path().join("absent.sock"))
        .with_timeout(500);
    let err = BusClient::connect(&options).await.unwrap_err();
    assert!(matches!(err, BusError::Connection(_)));
}

#[tokio::test]
async fn test_broker_refuses_live_socket_path() {
    let bus = common::start_broker().await;
    let second = Broker::new();
    let err = second.start(&bus.options).await.unwrap_err();
    assert!(matches!(err, BusError::Connection(_)));
}

#[tokio::test]
async fn test_broker_reclaims_stale_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sock");
    // A listener that dies without cleanup leaves its socket file behind.
    let abandoned = tokio::net::UnixListener::bind(&path).unwrap();
    drop(abandoned);
    assert!(path.exists());

    let broker = Broker::new();
    broker
        .start(&ConnectOptions::default().with_path(&path))
        .await
        .unwrap();
    broker.close(&CloseOptions::default()).await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_broker_close_drops_clients() {
    let bus = common::start_broker().await;
    let transport = common::connect_transport(&bus.options).await;
    assert!(transport.is_connected());

    bus.broker.close(&CloseOptions::default()).await.unwrap();
    // The dropped link surfaces as a shutdown on the client side.
    for _ in 0..200 {
        if !transport.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!transport.is_connected());
}
