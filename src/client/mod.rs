//! Public client facade over a shared transport.
//!
//! Any number of clients can attach to one transport; each gets its own
//! peer identity while sharing the process's single bus link.

use std::sync::Arc;

use serde_json::Value;

use crate::codec::{JsonCodec, PayloadCodec};
use crate::command::{Peer, ProcessKind, QueryStateSnapshot, Target};
use crate::config::{effective_timeout, CloseOptions, ConnectOptions};
use crate::connector::SocketConnector;
use crate::error::{RequestError, RequestResponse, Result};
use crate::transport::{BusContext, BusEvent, ClientId, ListenerId, Transport};

/// One endpoint identity on the bus.
pub struct BusClient {
    transport: Arc<Transport>,
    id: ClientId,
    peer: Peer,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl BusClient {
    /// Connect a fresh transport over a socket link and attach the first
    /// client to it. Further clients can [`attach`](Self::attach) to the
    /// same transport.
    pub async fn connect(options: &ConnectOptions) -> Result<Self> {
        let context = BusContext::new(ProcessKind::Node);
        let codec: Arc<dyn PayloadCodec> = Arc::new(JsonCodec);
        let connector = Arc::new(SocketConnector::new(ProcessKind::Node, codec.clone()));
        let transport = Transport::new(context, connector, codec);
        transport.connect(options).await?;
        Ok(Self::attach(transport, options.peer_name.as_deref()))
    }

    /// Attach a new client identity to an existing transport.
    pub fn attach(transport: Arc<Transport>, name: Option<&str>) -> Self {
        let (id, peer) = transport.create_client(name);
        Self {
            transport,
            id,
            peer,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Channel name on which this client can be addressed directly.
    pub fn direct_channel(&self) -> String {
        format!("/interbus/direct/{}", self.peer.id)
    }

    /// Publish to every subscriber of `channel`.
    pub fn send(&self, channel: &str, args: Vec<Value>) {
        self.transport.send(&self.peer, channel, args, None);
    }

    /// Deliver to exactly one peer, bypassing fan-out.
    pub fn send_to(&self, target: &Peer, channel: &str, args: Vec<Value>) {
        self.transport
            .send(&self.peer, channel, args, Some(Target::peer(target)));
    }

    /// Issue a request and await the first settlement. `None` means the
    /// default timeout; a negative value waits forever.
    pub async fn request(
        &self,
        channel: &str,
        timeout_ms: Option<i64>,
        args: Vec<Value>,
    ) -> std::result::Result<RequestResponse, RequestError> {
        self.transport
            .request(&self.peer, channel, effective_timeout(timeout_ms), args, None)
            .await
    }

    /// Request a specific peer.
    pub async fn request_to(
        &self,
        target: &Peer,
        channel: &str,
        timeout_ms: Option<i64>,
        args: Vec<Value>,
    ) -> std::result::Result<RequestResponse, RequestError> {
        self.transport
            .request(
                &self.peer,
                channel,
                effective_timeout(timeout_ms),
                args,
                Some(Target::peer(target)),
            )
            .await
    }

    /// Snapshot the far side's routing state (peers and channel refcounts)
    /// over the reserved diagnostics channel.
    pub async fn query_state(
        &self,
        timeout_ms: Option<i64>,
    ) -> Result<QueryStateSnapshot> {
        self.transport
            .query_state(self.id, &self.peer, effective_timeout(timeout_ms))
            .await
    }

    /// Subscribe to a channel.
    pub fn on<F>(&self, channel: &str, listener: F) -> ListenerId
    where
        F: Fn(&BusEvent, &[Value]) + Send + Sync + 'static,
    {
        self.transport
            .add_listener(self.id, channel, Arc::new(listener))
    }

    /// Drop one subscription.
    pub fn off(&self, channel: &str, listener: ListenerId) {
        self.transport.remove_listener(self.id, channel, listener);
    }

    /// Drop this client's subscriptions on one channel, or all of them.
    pub fn remove_all_listeners(&self, channel: Option<&str>) {
        self.transport.remove_all_listeners(self.id, channel);
    }

    /// Detach this client, keeping the shared transport up for others.
    pub fn detach(self) {
        self.transport.remove_client(self.id);
    }

    /// Detach and close the underlying transport. Other clients attached
    /// to the same transport lose their link too.
    pub async fn close(self, options: &CloseOptions) -> Result<()> {
        self.transport.remove_client(self.id);
        self.transport.close(options).await
    }
}
