//! Bridge with an embedded broker: hosted transports talking to remote
//! processes.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use interbus::bridge::Bridge;
use interbus::client::BusClient;
use interbus::codec::JsonCodec;
use interbus::command::ProcessKind;
use interbus::config::ConnectOptions;
use interbus::transport::BusContext;

use crate::common;

fn host_bridge() -> Arc<Bridge> {
    Bridge::new(BusContext::new(ProcessKind::Main), Arc::new(JsonCodec))
}

#[tokio::test]
async fn test_remote_send_reaches_main_transport() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.sock");
    let bridge = host_bridge();

    // Subscribing before the socket comes up puts the channel into the
    // BridgeConnect announcement, so the broker knows from frame one.
    let main = bridge.main_transport();
    let (client, _) = main.create_client(None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    main.add_listener(
        client,
        "a",
        Arc::new(move |_, args| {
            let _ = tx.send(args.to_vec());
        }),
    );

    bridge
        .connect(&ConnectOptions::default().with_path(&path).with_server(true))
        .await
        .unwrap();

    let remote = BusClient::connect(&ConnectOptions::default().with_path(&path))
        .await
        .unwrap();
    remote.send("a", vec![json!("over the wire")]);

    assert_eq!(common::recv_soon(&mut rx).await, vec![json!("over the wire")]);
}

#[tokio::test]
async fn test_main_send_reaches_remote_over_tcp() {
    let bridge = Bridge::new(BusContext::new(ProcessKind::Main), Arc::new(JsonCodec));
    bridge
        .connect(&ConnectOptions::default().with_port(0).with_server(true))
        .await
        .unwrap();
    let broker = bridge.embedded_broker().expect("embedded broker");
    let port = broker.local_port().expect("bound port");

    let remote = BusClient::connect(&ConnectOptions::default().with_port(port))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    remote.on("b", move |_, args| {
        let _ = tx.send(args.to_vec());
    });
    common::wait_for_channel(&broker, "b").await;

    // The broker's interest announcement races the first send; keep sending
    // until it lands.
    let main = bridge.main_transport();
    let (_, sender) = main.create_client(None);
    let args = common::pump_until(
        || main.send(&sender, "b", vec![json!("downlink")], None),
        &mut rx,
    )
    .await;
    assert_eq!(args, vec![json!("downlink")]);
}

#[tokio::test]
async fn test_remote_request_answered_by_main() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.sock");
    let bridge = host_bridge();

    let main = bridge.main_transport();
    let (client, _) = main.create_client(None);
    main.add_listener(
        client,
        "calc",
        Arc::new(|event, args| {
            let product: i64 = args.iter().filter_map(Value::as_i64).product();
            if let Some(request) = &event.request {
                request.resolve(json!(product));
            }
        }),
    );

    bridge
        .connect(&ConnectOptions::default().with_path(&path).with_server(true))
        .await
        .unwrap();

    let remote = BusClient::connect(&ConnectOptions::default().with_path(&path))
        .await
        .unwrap();
    let response = remote
        .request("calc", Some(2000), vec![json!(6), json!(7)])
        .await
        .unwrap();
    assert_eq!(response.payload, json!(42));
}

#[tokio::test]
async fn test_frame_transport_reaches_remote_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.sock");
    let bridge = host_bridge();
    bridge
        .connect(&ConnectOptions::default().with_path(&path).with_server(true))
        .await
        .unwrap();
    let broker = bridge.embedded_broker().expect("embedded broker");

    let remote = BusClient::connect(&ConnectOptions::default().with_path(&path))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    remote.on("ping", move |event, _| {
        let _ = tx.send(event.sender.id.clone());
    });
    common::wait_for_channel(&broker, "ping").await;

    let frame = bridge.add_frame_transport("view-1").await.unwrap();
    let (_, frame_peer) = frame.create_client(None);
    let sender_id = common::pump_until(
        || frame.send(&frame_peer, "ping", vec![], None),
        &mut rx,
    )
    .await;
    assert_eq!(sender_id, frame_peer.id);
}

#[tokio::test]
async fn test_bridge_close_shuts_embedded_broker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.sock");
    let bridge = host_bridge();
    bridge
        .connect(&ConnectOptions::default().with_path(&path).with_server(true))
        .await
        .unwrap();

    bridge.close(&interbus::CloseOptions::default()).await.unwrap();
    // The socket file is unlinked, so a fresh dial must fail.
    assert!(
        BusClient::connect(&ConnectOptions::default().with_path(&path).with_timeout(200))
            .await
            .is_err()
    );
}
