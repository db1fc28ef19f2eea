//! The seam between a transport and whatever carries its frames.
//!
//! A [`Connector`] owns one bidirectional link. The transport hands it a
//! [`ConnectorSink`] at handshake time and receives inbound frames through
//! it; outbound traffic goes through `post_command` (structured) or
//! `post_buffer` (already framed, forwarded untouched). Two implementations
//! exist: [`SocketConnector`] for TCP/Unix-domain links and
//! [`PairConnector`] for in-process links that never serialize.

mod pair;
mod socket;

pub use pair::{PairConnector, PairHandler};
pub use socket::SocketConnector;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::command::{Command, Frame, Payload, ProcessDescriptor};
use crate::config::{CloseOptions, ConnectOptions};
use crate::error::{BusError, Result};

/// Object-safe alias for the byte streams sockets are split into.
pub(crate) trait IoStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> IoStream for T {}

/// Outcome of a successful connector handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub process: ProcessDescriptor,
    /// Identifies the bus instance this link belongs to.
    pub instance_id: Uuid,
    /// Negotiated trace level; zero disables stamping.
    pub trace_level: u8,
}

/// Receiving side of a connector.
pub trait ConnectorSink: Send + Sync {
    fn on_command(&self, frame: Frame);
    /// The link went away, cleanly or not. Fires at most once.
    fn on_shutdown(&self);
}

/// One bidirectional link an endpoint speaks over.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn handshake(
        &self,
        sink: Arc<dyn ConnectorSink>,
        options: &ConnectOptions,
    ) -> Result<Handshake>;

    /// Tear the link down. Resolves without error when the link is already
    /// down.
    async fn shutdown(&self, options: &CloseOptions) -> Result<()>;

    /// Post an envelope with its payload in whatever form it currently
    /// exists. Posts after shutdown are dropped, not errors.
    fn post_command(&self, command: Command, payload: Payload);

    /// Forward an already-framed buffer untouched.
    fn post_buffer(&self, raw: Bytes);
}

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Serializes connect/close so concurrent callers coalesce onto one attempt
/// instead of racing. The async mutex orders the operations; the sync mutex
/// lets non-async paths observe the current state.
pub struct LifecycleGate {
    op: tokio::sync::Mutex<()>,
    state: std::sync::Mutex<LinkState>,
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGate {
    pub fn new() -> Self {
        Self {
            op: tokio::sync::Mutex::new(()),
            state: std::sync::Mutex::new(LinkState::Idle),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    pub fn set(&self, state: LinkState) {
        *self.state.lock().unwrap() = state;
    }

    /// Begin a connect attempt. Returns `None` when an earlier call already
    /// established the link, which is how concurrent connects coalesce: the
    /// second caller waits on the op lock, then sees `Connected`.
    pub async fn begin_connect(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let guard = self.op.lock().await;
        {
            let mut state = self.state.lock().unwrap();
            if *state == LinkState::Connected {
                return None;
            }
            *state = LinkState::Connecting;
        }
        Some(guard)
    }

    /// Begin a close. Returns `None` when there is nothing to close.
    pub async fn begin_close(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let guard = self.op.lock().await;
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                LinkState::Connected => *state = LinkState::Closing,
                _ => return None,
            }
        }
        Some(guard)
    }
}

/// Run `fut` under the millisecond deadline convention: negative disables
/// the deadline entirely.
pub(crate) async fn with_deadline<T, F>(timeout_ms: i64, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    if timeout_ms < 0 {
        fut.await
    } else {
        tokio::time::timeout(std::time::Duration::from_millis(timeout_ms as u64), fut)
            .await
            .map_err(|_| BusError::Timeout(timeout_ms))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_connect_then_close() {
        let gate = LifecycleGate::new();
        assert_eq!(gate.state(), LinkState::Idle);

        let guard = gate.begin_connect().await;
        assert!(guard.is_some());
        gate.set(LinkState::Connected);
        drop(guard);

        assert!(gate.begin_connect().await.is_none());

        let guard = gate.begin_close().await;
        assert!(guard.is_some());
        gate.set(LinkState::Closed);
        drop(guard);

        assert!(gate.begin_close().await.is_none());
    }

    #[tokio::test]
    async fn test_gate_coalesces_concurrent_connects() {
        let gate = std::sync::Arc::new(LifecycleGate::new());

        let slow = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let guard = gate.begin_connect().await;
                assert!(guard.is_some());
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                gate.set(LinkState::Connected);
                drop(guard);
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // Second caller blocks on the op lock, then observes Connected.
        assert!(gate.begin_connect().await.is_none());
        slow.await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_negative_means_forever() {
        let out = with_deadline(-1, async { Ok::<_, crate::error::BusError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let err = with_deadline(10, async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok::<_, crate::error::BusError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BusError::Timeout(10)));
    }
}
