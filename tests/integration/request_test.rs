//! Request/response across processes.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use interbus::client::BusClient;
use interbus::transport::RequestResponder;

use crate::common;

#[tokio::test]
async fn test_request_resolved_remotely() {
    let bus = common::start_broker().await;

    let asker = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let answerer = BusClient::attach(common::connect_transport(&bus.options).await, None);

    answerer.on("sum", |event, args| {
        let total: i64 = args.iter().filter_map(Value::as_i64).sum();
        if let Some(request) = &event.request {
            request.resolve(json!(total));
        }
    });
    common::wait_for_channel(&bus.broker, "sum").await;

    let response = asker
        .request("sum", Some(2000), vec![json!(2), json!(3)])
        .await
        .unwrap();
    assert_eq!(response.payload, json!(5));
    assert_eq!(response.sender.process.kind, interbus::ProcessKind::Node);
}

#[tokio::test]
async fn test_request_rejected_remotely() {
    let bus = common::start_broker().await;

    let asker = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let answerer = BusClient::attach(common::connect_transport(&bus.options).await, None);

    answerer.on("guard", |event, _| {
        if let Some(request) = &event.request {
            request.reject(json!("denied"));
        }
    });
    common::wait_for_channel(&bus.broker, "guard").await;

    let err = asker
        .request("guard", Some(2000), vec![])
        .await
        .unwrap_err();
    assert_eq!(err.err, json!("denied"));
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let bus = common::start_broker().await;
    let asker = BusClient::attach(common::connect_transport(&bus.options).await, None);

    let err = asker
        .request("void", Some(100), vec![json!("anyone?")])
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_only_first_settlement_wins() {
    let bus = common::start_broker().await;

    let asker = BusClient::attach(common::connect_transport(&bus.options).await, None);
    // Two responders race; the requester sees exactly one outcome.
    let fast = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let slow = BusClient::attach(common::connect_transport(&bus.options).await, None);

    fast.on("race", |event, _| {
        if let Some(request) = &event.request {
            request.resolve(json!("fast"));
        }
    });
    slow.on("race", |event, _| {
        if let Some(request) = &event.request {
            request.resolve(json!("slow"));
        }
    });
    common::wait_for_refs(&bus.broker, "race", 2).await;

    let response = asker.request("race", Some(2000), vec![]).await.unwrap();
    assert!(response.payload == json!("fast") || response.payload == json!("slow"));
}

#[tokio::test]
async fn test_in_flight_requests_correlated_out_of_order() {
    let bus = common::start_broker().await;

    let asker = Arc::new(BusClient::attach(
        common::connect_transport(&bus.options).await,
        None,
    ));
    let answerer = BusClient::attach(common::connect_transport(&bus.options).await, None);

    // Hold both requests, then answer them newest first; correlation is by
    // request id, not arrival order.
    let held: Arc<Mutex<Vec<(RequestResponder, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let pending = held.clone();
    answerer.on("tagged", move |event, args| {
        let responder = event.request.clone().expect("request event");
        let mut pending = pending.lock().unwrap();
        pending.push((responder, args[0].clone()));
        if pending.len() == 2 {
            for (responder, tag) in pending.drain(..).rev() {
                responder.resolve(tag);
            }
        }
    });
    common::wait_for_channel(&bus.broker, "tagged").await;

    let first = {
        let asker = asker.clone();
        tokio::spawn(async move { asker.request("tagged", Some(2000), vec![json!("one")]).await })
    };
    let second = {
        let asker = asker.clone();
        tokio::spawn(async move { asker.request("tagged", Some(2000), vec![json!("two")]).await })
    };

    assert_eq!(first.await.unwrap().unwrap().payload, json!("one"));
    assert_eq!(second.await.unwrap().unwrap().payload, json!("two"));
}

#[tokio::test]
async fn test_request_to_direct_channel() {
    let bus = common::start_broker().await;

    let asker = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let worker = BusClient::attach(common::connect_transport(&bus.options).await, None);
    let bystander = BusClient::attach(common::connect_transport(&bus.options).await, None);

    let direct = worker.direct_channel();
    worker.on(&direct, |event, args| {
        if let Some(request) = &event.request {
            request.resolve(json!(format!("done: {}", args[0].as_str().unwrap_or(""))));
        }
    });
    // The bystander listens on the same channel but is not the target.
    let (spy_tx, mut spy_rx) = mpsc::unbounded_channel();
    bystander.on(&direct, move |_, _| {
        let _ = spy_tx.send(());
    });
    common::wait_for_refs(&bus.broker, &direct, 2).await;

    let response = asker
        .request_to(worker.peer(), &direct, Some(2000), vec![json!("job")])
        .await
        .unwrap();
    assert_eq!(response.payload, json!("done: job"));
    common::assert_quiet(&mut spy_rx).await;
}
