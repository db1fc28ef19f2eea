//! Shared utilities for integration tests.
//!
//! Each test gets its own broker on a Unix socket under a temp directory,
//! plus helpers for the subscribe-then-send races inherent to an async bus.

use std::sync::Arc;
use std::time::Duration;

use interbus::broker::Broker;
use interbus::codec::JsonCodec;
use interbus::command::ProcessKind;
use interbus::config::ConnectOptions;
use interbus::connector::SocketConnector;
use interbus::transport::{BusContext, Transport};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct TestBus {
    pub broker: Broker,
    pub options: ConnectOptions,
    _dir: TempDir,
}

/// Opt-in log output for debugging test runs (`RUST_LOG=interbus=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Start a broker on a fresh Unix socket path.
pub async fn start_broker() -> TestBus {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    let options = ConnectOptions::default().with_path(dir.path().join("bus.sock"));
    let broker = Broker::new();
    broker.start(&options).await.expect("broker start");
    TestBus {
        broker,
        options,
        _dir: dir,
    }
}

/// Connect a standalone transport to the broker, as a separate process
/// would.
pub async fn connect_transport(options: &ConnectOptions) -> Arc<Transport> {
    let codec = Arc::new(JsonCodec);
    let connector = Arc::new(SocketConnector::new(ProcessKind::Node, codec.clone()));
    let transport = Transport::new(BusContext::new(ProcessKind::Node), connector, codec);
    transport.connect(options).await.expect("transport connect");
    transport
}

/// Block until the broker has registered a subscriber on `channel`.
pub async fn wait_for_channel(broker: &Broker, channel: &str) {
    for _ in 0..200 {
        let snapshot = broker.query_state().await.expect("query state");
        if snapshot.channels.iter().any(|c| c.channel == channel) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel {channel} never registered at broker");
}

/// Block until `channel` holds at least `refs` subscription references at
/// the broker.
pub async fn wait_for_refs(broker: &Broker, channel: &str, refs: u32) {
    for _ in 0..200 {
        let snapshot = broker.query_state().await.expect("query state");
        let seen = snapshot
            .channels
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| c.refcount)
            .unwrap_or(0);
        if seen >= refs {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel {channel} never reached {refs} references");
}

/// Block until the broker has no subscriber left on `channel`.
pub async fn wait_for_channel_gone(broker: &Broker, channel: &str) {
    for _ in 0..200 {
        let snapshot = broker.query_state().await.expect("query state");
        if !snapshot.channels.iter().any(|c| c.channel == channel) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel {channel} never drained at broker");
}

/// Re-issue `send` until something lands in `rx`. Covers the window where
/// interest announcements are still in flight.
pub async fn pump_until<T>(mut send: impl FnMut(), rx: &mut UnboundedReceiver<T>) -> T {
    for _ in 0..100 {
        send();
        if let Ok(Some(value)) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            return value;
        }
    }
    panic!("nothing received after repeated sends");
}

/// Receive with a deadline.
pub async fn recv_soon<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

/// Assert nothing further arrives for a little while.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "unexpected delivery: {:?}", extra);
}
