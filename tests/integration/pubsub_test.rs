//! Publish/subscribe across processes through a broker.

use serde_json::json;
use tokio::sync::mpsc;

use interbus::client::BusClient;

use crate::common;

#[tokio::test]
async fn test_cross_process_delivery() {
    let bus = common::start_broker().await;

    let publisher = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let subscriber = BusClient::attach(common::connect_transport(&bus.options).await, None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber.on("news", move |event, args| {
        let _ = tx.send((event.sender.id.clone(), args.to_vec()));
    });
    common::wait_for_channel(&bus.broker, "news").await;

    publisher.send("news", vec![json!("extra"), json!(42)]);

    let (sender_id, args) = common::recv_soon(&mut rx).await;
    assert_eq!(sender_id, publisher.peer().id);
    assert_eq!(args, vec![json!("extra"), json!(42)]);
}

#[tokio::test]
async fn test_no_echo_and_local_fanout() {
    let bus = common::start_broker().await;

    // The sender subscribes to its own channel: one local delivery, and the
    // broker must not echo the frame back for a second one.
    let sender = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let remote = BusClient::attach(common::connect_transport(&bus.options).await, None);

    let (sender_tx, mut sender_rx) = mpsc::unbounded_channel();
    sender.on("a", move |_, _| {
        let _ = sender_tx.send(());
    });
    let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
    remote.on("a", move |_, _| {
        let _ = remote_tx.send(());
    });
    common::wait_for_refs(&bus.broker, "a", 2).await;

    sender.send("a", vec![json!(1)]);

    common::recv_soon(&mut sender_rx).await;
    common::recv_soon(&mut remote_rx).await;
    common::assert_quiet(&mut sender_rx).await;
    common::assert_quiet(&mut remote_rx).await;
}

#[tokio::test]
async fn test_unsubscribed_channel_not_delivered() {
    let bus = common::start_broker().await;

    let publisher = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let subscriber = BusClient::attach(common::connect_transport(&bus.options).await, None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber.on("wanted", move |_, args| {
        let _ = tx.send(args.to_vec());
    });
    common::wait_for_channel(&bus.broker, "wanted").await;

    publisher.send("unwanted", vec![json!("noise")]);
    publisher.send("wanted", vec![json!("signal")]);

    assert_eq!(common::recv_soon(&mut rx).await, vec![json!("signal")]);
    common::assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_unsubscribe_reaches_broker() {
    let bus = common::start_broker().await;

    let subscriber = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let listener = subscriber.on("temp", |_, _| {});
    common::wait_for_channel(&bus.broker, "temp").await;

    subscriber.off("temp", listener);
    common::wait_for_channel_gone(&bus.broker, "temp").await;
}

#[tokio::test]
async fn test_disconnect_cleans_registry() {
    let bus = common::start_broker().await;

    let transport = common::connect_transport(&bus.options).await;
    let subscriber = BusClient::attach(transport, None);
    subscriber.on("doomed", |_, _| {});
    common::wait_for_channel(&bus.broker, "doomed").await;

    subscriber.close(&interbus::CloseOptions::default()).await.unwrap();
    common::wait_for_channel_gone(&bus.broker, "doomed").await;
}

#[tokio::test]
async fn test_query_state_over_the_wire() {
    let bus = common::start_broker().await;
    let client = BusClient::attach(common::connect_transport(&bus.options).await, None);
    client.on("x", |_, _| {});
    common::wait_for_channel(&bus.broker, "x").await;

    // The broker answers on the reserved diagnostics channel.
    let snapshot = client.query_state(Some(2000)).await.unwrap();
    assert_eq!(snapshot.endpoint, "broker");
    assert!(snapshot.channels.iter().any(|c| c.channel == "x"));
}

#[tokio::test]
async fn test_broker_state_snapshot() {
    let bus = common::start_broker().await;

    let subscriber = BusClient::attach(common::connect_transport(&bus.options).await, None);
    subscriber.on("x", |_, _| {});
    subscriber.on("y", |_, _| {});
    common::wait_for_channel(&bus.broker, "x").await;
    common::wait_for_channel(&bus.broker, "y").await;

    let snapshot = bus.broker.query_state().await.unwrap();
    assert_eq!(snapshot.endpoint, "broker");
    let mut channels: Vec<_> = snapshot.channels.iter().map(|c| c.channel.clone()).collect();
    channels.sort();
    assert_eq!(channels, vec!["x", "y"]);
}
