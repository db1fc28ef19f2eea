//! Client transport: local dispatch, request correlation and the shared
//! per-process link.
//!
//! One transport owns one connector and serves any number of in-process
//! clients. Listener bookkeeping is per client, but channel interest is
//! aggregated: `AddChannelListener`/`RemoveChannelListener` reach the wire
//! only when the transport-wide refcount crosses zero, so the broker sees
//! the whole process as a single subscriber.
//!
//! Dispatch is local-first: a send is delivered to matching in-process
//! listeners before it is forwarded, and forwarding is skipped when an
//! explicit target was matched locally. Requests skip forwarding whenever a
//! local listener received them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::PayloadCodec;
use crate::command::{
    Command, CommandKind, Frame, Payload, Peer, ProcessDescriptor, ProcessKind,
    QueryStateSnapshot, RequestRef, Stamp, Target, QUERY_STATE_CHANNEL,
};
use crate::config::{CloseOptions, ConnectOptions};
use crate::connector::{with_deadline, Connector, ConnectorSink, LifecycleGate, LinkState};
use crate::error::{BusError, RequestError, RequestResponse, Result};
use crate::registry::ChannelsRefCount;

/// Identifies one client attached to a transport.
pub type ClientId = u64;

/// Identifies one registered listener.
pub type ListenerId = u64;

/// Callback invoked for every message delivered to a subscribed channel.
pub type Listener = Arc<dyn Fn(&BusEvent, &[Value]) + Send + Sync>;

/// Process-wide identity source. All peers minted from one context share
/// the `{kind}-{pid}` signature and draw from one monotonic sequence.
pub struct BusContext {
    process: ProcessDescriptor,
    sequence: AtomicU64,
}

impl BusContext {
    pub fn new(kind: ProcessKind) -> Arc<Self> {
        Arc::new(Self {
            process: ProcessDescriptor::new(kind),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn process(&self) -> &ProcessDescriptor {
        &self.process
    }

    /// Mint a fresh peer: `{kind}-{pid}.{seq}`, name defaulting to the id.
    pub fn mint_peer(&self, name: Option<&str>) -> Peer {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}.{}", self.process.signature(), seq);
        Peer {
            name: name.map(str::to_string).unwrap_or_else(|| id.clone()),
            id,
            process: self.process.clone(),
        }
    }
}

/// What a listener sees for each delivered message.
pub struct BusEvent {
    pub channel: String,
    pub sender: Peer,
    /// Present when the message is a request; settle it through here.
    pub request: Option<RequestResponder>,
}

struct ResponderInner {
    transport: Weak<Transport>,
    request: RequestRef,
    requester: Peer,
    local: bool,
    settled: AtomicBool,
}

/// Settles one inbound request. Cloneable so a listener can answer later;
/// only the first `resolve`/`reject` wins, the rest are silently dropped.
#[derive(Clone)]
pub struct RequestResponder {
    inner: Arc<ResponderInner>,
}

impl RequestResponder {
    pub fn resolve(&self, payload: Value) {
        self.settle("resolve", payload);
    }

    pub fn reject(&self, err: Value) {
        self.settle("reject", err);
    }

    fn settle(&self, status: &str, value: Value) {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            debug!(request = %self.inner.request.id, "request already settled, dropping");
            return;
        }
        let Some(transport) = self.inner.transport.upgrade() else {
            return;
        };
        if self.inner.local {
            let outcome = if status == "resolve" {
                Ok(RequestResponse {
                    channel: self.inner.request.channel.clone(),
                    sender: transport.local_peer(),
                    payload: value,
                })
            } else {
                Err(RequestError {
                    channel: self.inner.request.channel.clone(),
                    sender: Some(transport.local_peer()),
                    err: value,
                })
            };
            transport.settle(&self.inner.request.id, outcome);
            transport.emit_trace(CommandKind::LogLocalRequestResponse, &self.inner.request.channel);
        } else {
            let command = Command::new(
                CommandKind::RequestResponse,
                &self.inner.request.channel,
                transport.local_peer(),
            )
            .with_target(Some(Target {
                peer_id: self.inner.requester.id.clone(),
            }))
            .with_request(self.inner.request.clone());
            let args = vec![Value::String(status.to_string()), value];
            transport
                .connector
                .post_command(command, Payload::Args(Arc::new(args)));
        }
    }
}

struct ClientState {
    peer: Peer,
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
}

struct PendingRequest {
    tx: oneshot::Sender<std::result::Result<RequestResponse, RequestError>>,
    channel: String,
}

/// The per-process bus endpoint.
pub struct Transport {
    context: Arc<BusContext>,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn PayloadCodec>,
    gate: LifecycleGate,
    peer: Mutex<Option<Peer>>,
    trace_level: AtomicU8,
    clients: Mutex<HashMap<ClientId, ClientState>>,
    next_client_id: AtomicU64,
    next_listener_id: AtomicU64,
    channel_refs: Mutex<ChannelsRefCount>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    weak: Weak<Transport>,
}

impl Transport {
    pub fn new(
        context: Arc<BusContext>,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            context,
            connector,
            codec,
            gate: LifecycleGate::new(),
            peer: Mutex::new(None),
            trace_level: AtomicU8::new(0),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            next_listener_id: AtomicU64::new(0),
            channel_refs: Mutex::new(ChannelsRefCount::new()),
            pending: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    pub fn context(&self) -> &Arc<BusContext> {
        &self.context
    }

    /// The transport's own identity, used for bookkeeping envelopes. Minted
    /// on first use.
    pub fn local_peer(&self) -> Peer {
        let mut peer = self.peer.lock().unwrap();
        peer.get_or_insert_with(|| self.context.mint_peer(None)).clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        let Some(_guard) = self.gate.begin_connect().await else {
            return Ok(());
        };
        let Some(this) = self.weak.upgrade() else {
            self.gate.set(LinkState::Closed);
            return Err(BusError::Closed);
        };
        let sink: Arc<dyn ConnectorSink> = this;
        match self.connector.handshake(sink, options).await {
            Ok(handshake) => {
                self.trace_level.store(handshake.trace_level, Ordering::Relaxed);
                let _ = self.local_peer();
                self.gate.set(LinkState::Connected);
                info!(peer = %self.local_peer(), "transport connected");
                Ok(())
            }
            Err(e) => {
                self.gate.set(LinkState::Idle);
                Err(e)
            }
        }
    }

    pub async fn close(&self, options: &CloseOptions) -> Result<()> {
        let Some(_guard) = self.gate.begin_close().await else {
            return Ok(());
        };
        let command = Command::new(CommandKind::Close, "", self.local_peer());
        self.connector.post_command(command, Payload::None);
        self.connector.shutdown(options).await?;
        self.drain_pending();
        self.gate.set(LinkState::Closed);
        info!(peer = %self.local_peer(), "transport closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.gate.state() == LinkState::Connected
    }

    /// Cancel every in-flight request as timed out. Used on close and when
    /// the link drops underneath us.
    fn drain_pending(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            let _ = p.tx.send(Err(RequestError::timeout(p.channel, None)));
        }
    }

    // ========================================================================
    // Clients and listeners
    // ========================================================================

    /// Attach a client and mint its peer identity.
    pub fn create_client(&self, name: Option<&str>) -> (ClientId, Peer) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = self.context.mint_peer(name);
        self.clients.lock().unwrap().insert(
            id,
            ClientState {
                peer: peer.clone(),
                listeners: HashMap::new(),
            },
        );
        (id, peer)
    }

    /// Detach a client, releasing all of its channel interest.
    pub fn remove_client(&self, client: ClientId) {
        let removed = self.clients.lock().unwrap().remove(&client);
        let Some(state) = removed else { return };
        for (channel, listeners) in state.listeners {
            self.release_refs(&channel, listeners.len() as u32);
        }
    }

    pub fn add_listener(&self, client: ClientId, channel: &str, listener: Listener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut clients = self.clients.lock().unwrap();
            let Some(state) = clients.get_mut(&client) else {
                warn!(client, "add_listener on unknown client");
                return id;
            };
            state
                .listeners
                .entry(channel.to_string())
                .or_default()
                .push((id, listener));
        }
        let first = self.channel_refs.lock().unwrap().add_ref(channel);
        if first {
            let command =
                Command::new(CommandKind::AddChannelListener, channel, self.local_peer());
            self.connector.post_command(command, Payload::None);
        }
        id
    }

    pub fn remove_listener(&self, client: ClientId, channel: &str, listener: ListenerId) {
        let removed = {
            let mut clients = self.clients.lock().unwrap();
            let Some(state) = clients.get_mut(&client) else {
                return;
            };
            let Some(listeners) = state.listeners.get_mut(channel) else {
                return;
            };
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != listener);
            let removed = before - listeners.len();
            if listeners.is_empty() {
                state.listeners.remove(channel);
            }
            removed as u32
        };
        self.release_refs(channel, removed);
    }

    /// Remove all of a client's listeners, on one channel or everywhere.
    pub fn remove_all_listeners(&self, client: ClientId, channel: Option<&str>) {
        let removed: Vec<(String, u32)> = {
            let mut clients = self.clients.lock().unwrap();
            let Some(state) = clients.get_mut(&client) else {
                return;
            };
            match channel {
                Some(channel) => state
                    .listeners
                    .remove(channel)
                    .map(|l| vec![(channel.to_string(), l.len() as u32)])
                    .unwrap_or_default(),
                None => state
                    .listeners
                    .drain()
                    .map(|(channel, l)| (channel, l.len() as u32))
                    .collect(),
            }
        };
        for (channel, count) in removed {
            self.release_refs(&channel, count);
        }
    }

    fn release_refs(&self, channel: &str, count: u32) {
        let mut last = false;
        {
            let mut refs = self.channel_refs.lock().unwrap();
            for _ in 0..count {
                last = refs.release(channel) || last;
            }
        }
        if last {
            let command =
                Command::new(CommandKind::RemoveChannelListener, channel, self.local_peer());
            self.connector.post_command(command, Payload::None);
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Publish on a channel: local listeners first, then the wire unless an
    /// explicit target was matched locally.
    pub fn send(&self, sender: &Peer, channel: &str, args: Vec<Value>, target: Option<Target>) {
        let args = Arc::new(args);
        let mut command = Command::new(CommandKind::SendMessage, channel, sender.clone())
            .with_target(target);
        self.stamp(&mut command);
        let (delivered, target_matched) = self.dispatch_local(&command, &args, None);
        if delivered {
            self.emit_trace(CommandKind::LogLocalSendRequest, channel);
        }
        if !target_matched {
            self.connector.post_command(command, Payload::Args(args));
        }
    }

    /// Issue a request and await its settlement. A negative timeout waits
    /// forever.
    pub async fn request(
        &self,
        sender: &Peer,
        channel: &str,
        timeout_ms: i64,
        args: Vec<Value>,
        target: Option<Target>,
    ) -> std::result::Result<RequestResponse, RequestError> {
        let request = RequestRef {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            request.id.clone(),
            PendingRequest {
                tx,
                channel: channel.to_string(),
            },
        );

        let args = Arc::new(args);
        let mut command = Command::new(CommandKind::RequestMessage, channel, sender.clone())
            .with_target(target)
            .with_request(request.clone());
        self.stamp(&mut command);

        let responder = self.make_responder(&request, sender, true);
        let (delivered, target_matched) =
            self.dispatch_local(&command, &args, Some(responder));
        if delivered {
            self.emit_trace(CommandKind::LogLocalSendRequest, channel);
        }
        if !delivered && !target_matched {
            self.connector
                .post_command(command.clone(), Payload::Args(args));
        }

        let still_pending = self.pending.lock().unwrap().contains_key(&request.id);
        if timeout_ms >= 0 && still_pending {
            let weak = self.weak.clone();
            let request = request.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms as u64)).await;
                if let Some(transport) = weak.upgrade() {
                    transport.expire_request(&request, &sender);
                }
            });
        }

        rx.await
            .unwrap_or_else(|_| Err(RequestError::timeout(channel, None)))
    }

    fn expire_request(&self, request: &RequestRef, sender: &Peer) {
        let expired = self.pending.lock().unwrap().remove(&request.id);
        let Some(p) = expired else { return };
        debug!(channel = %p.channel, request = %request.id, "request timed out");
        let _ = p.tx.send(Err(RequestError::timeout(&p.channel, None)));
        // Best effort so the far side can drop its bookkeeping.
        let command = Command::new(CommandKind::RequestCancel, &request.channel, sender.clone())
            .with_request(request.clone());
        self.connector.post_command(command, Payload::None);
    }

    fn settle(
        &self,
        request_id: &str,
        outcome: std::result::Result<RequestResponse, RequestError>,
    ) {
        let pending = self.pending.lock().unwrap().remove(request_id);
        match pending {
            Some(p) => {
                let _ = p.tx.send(outcome);
            }
            None => debug!(request = %request_id, "late settlement, dropping"),
        }
    }

    fn make_responder(&self, request: &RequestRef, requester: &Peer, local: bool) -> RequestResponder {
        RequestResponder {
            inner: Arc::new(ResponderInner {
                transport: self.weak.clone(),
                request: request.clone(),
                requester: requester.clone(),
                local,
                settled: AtomicBool::new(false),
            }),
        }
    }

    fn stamp(&self, command: &mut Command) {
        if self.trace_level.load(Ordering::Relaxed) > 0 {
            command.stamp = Some(Stamp {
                id: Uuid::new_v4().to_string(),
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                local: true,
            });
        }
    }

    fn emit_trace(&self, kind: CommandKind, channel: &str) {
        if self.trace_level.load(Ordering::Relaxed) > 0 {
            let command = Command::new(kind, channel, self.local_peer());
            self.connector.post_command(command, Payload::None);
        }
    }

    // ========================================================================
    // Local dispatch
    // ========================================================================

    /// Deliver to in-process listeners. Returns `(delivered, target_matched)`:
    /// whether any listener ran, and whether an explicit target named a local
    /// client.
    fn dispatch_local(
        &self,
        command: &Command,
        args: &Arc<Vec<Value>>,
        responder: Option<RequestResponder>,
    ) -> (bool, bool) {
        let mut to_invoke: Vec<Listener> = Vec::new();
        let mut target_matched = false;
        {
            let clients = self.clients.lock().unwrap();
            match &command.target {
                Some(target) => {
                    for state in clients.values() {
                        if state.peer.id == target.peer_id {
                            target_matched = true;
                            if let Some(listeners) = state.listeners.get(&command.channel) {
                                to_invoke.extend(listeners.iter().map(|(_, l)| l.clone()));
                            }
                        }
                    }
                }
                None => {
                    for state in clients.values() {
                        if let Some(listeners) = state.listeners.get(&command.channel) {
                            to_invoke.extend(listeners.iter().map(|(_, l)| l.clone()));
                        }
                    }
                }
            }
        }
        if to_invoke.is_empty() {
            return (false, target_matched);
        }
        let event = BusEvent {
            channel: command.channel.clone(),
            sender: command.peer.clone(),
            request: responder,
        };
        for listener in to_invoke {
            listener(&event, args);
        }
        (true, target_matched)
    }

    /// Query the far side's routing state over the reserved channel. The
    /// first snapshot targeted back at `sender` settles the call.
    pub async fn query_state(
        &self,
        client: ClientId,
        sender: &Peer,
        timeout_ms: i64,
    ) -> Result<QueryStateSnapshot> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let reply = slot.clone();
        let listener = self.add_listener(
            client,
            QUERY_STATE_CHANNEL,
            Arc::new(move |_, args| {
                let Some(value) = args.first() else { return };
                let Ok(snapshot) = serde_json::from_value::<QueryStateSnapshot>(value.clone())
                else {
                    return;
                };
                let tx = reply.lock().unwrap().take();
                if let Some(tx) = tx {
                    let _ = tx.send(snapshot);
                }
            }),
        );
        let command = Command::new(CommandKind::QueryState, QUERY_STATE_CHANNEL, sender.clone());
        self.connector.post_command(command, Payload::None);
        let outcome =
            with_deadline(timeout_ms, async { rx.await.map_err(|_| BusError::Closed) }).await;
        self.remove_listener(client, QUERY_STATE_CHANNEL, listener);
        outcome
    }

    /// Transport-level state snapshot for the reserved query channel.
    pub fn query_snapshot(&self) -> QueryStateSnapshot {
        let peers = self
            .clients
            .lock()
            .unwrap()
            .values()
            .map(|state| state.peer.clone())
            .collect();
        QueryStateSnapshot {
            endpoint: "transport".to_string(),
            peers,
            channels: self.channel_refs.lock().unwrap().snapshot(),
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

impl ConnectorSink for Transport {
    fn on_command(&self, frame: Frame) {
        let command = frame.command;
        match command.kind {
            CommandKind::SendMessage => {
                let args = match frame.payload.args(self.codec.as_ref()) {
                    Ok(args) => args,
                    Err(e) => {
                        error!(error = %e, channel = %command.channel, "dropping undecodable message");
                        return;
                    }
                };
                let (delivered, _) = self.dispatch_local(&command, &args, None);
                if delivered {
                    self.emit_trace(CommandKind::LogGetMessage, &command.channel);
                }
            }
            CommandKind::RequestMessage => {
                let Some(request) = command.request.clone() else {
                    warn!(channel = %command.channel, "request without correlation data");
                    return;
                };
                let args = match frame.payload.args(self.codec.as_ref()) {
                    Ok(args) => args,
                    Err(e) => {
                        error!(error = %e, channel = %command.channel, "dropping undecodable request");
                        return;
                    }
                };
                let responder = self.make_responder(&request, &command.peer, false);
                let (delivered, _) = self.dispatch_local(&command, &args, Some(responder));
                if delivered {
                    self.emit_trace(CommandKind::LogGetMessage, &command.channel);
                }
            }
            CommandKind::RequestResponse => {
                let Some(request) = command.request.as_ref() else {
                    warn!("response without correlation data");
                    return;
                };
                let outcome = match frame.payload.args(self.codec.as_ref()) {
                    Ok(args) => match (args.first().and_then(Value::as_str), args.get(1)) {
                        (Some("resolve"), Some(value)) => Ok(RequestResponse {
                            channel: request.channel.clone(),
                            sender: command.peer.clone(),
                            payload: value.clone(),
                        }),
                        (Some("reject"), Some(value)) => Err(RequestError {
                            channel: request.channel.clone(),
                            sender: Some(command.peer.clone()),
                            err: value.clone(),
                        }),
                        _ => Err(RequestError {
                            channel: request.channel.clone(),
                            sender: Some(command.peer.clone()),
                            err: Value::String("unknown format".to_string()),
                        }),
                    },
                    Err(_) => Err(RequestError {
                        channel: request.channel.clone(),
                        sender: Some(command.peer.clone()),
                        err: Value::String("unknown format".to_string()),
                    }),
                };
                self.settle(&request.id, outcome);
            }
            CommandKind::RequestCancel => {
                debug!(channel = %command.channel, "request cancelled by requester");
            }
            CommandKind::QueryState => {
                let snapshot = self.query_snapshot();
                match serde_json::to_value(&snapshot) {
                    Ok(value) => {
                        let response = Command::new(
                            CommandKind::QueryStateResponse,
                            QUERY_STATE_CHANNEL,
                            self.local_peer(),
                        )
                        .with_target(Some(Target::peer(&command.peer)));
                        self.connector
                            .post_command(response, Payload::Args(Arc::new(vec![value])));
                    }
                    Err(e) => error!(error = %e, "state snapshot serialization failed"),
                }
            }
            CommandKind::QueryStateResponse => {
                if let Ok(args) = frame.payload.args(self.codec.as_ref()) {
                    self.dispatch_local(&command, &args, None);
                }
            }
            // Bookkeeping kinds flow toward broker and bridge, not here.
            _ => debug!(kind = ?command.kind, "ignoring command kind"),
        }
    }

    fn on_shutdown(&self) {
        if self.gate.state() == LinkState::Connected {
            warn!("link dropped, cancelling in-flight requests");
            self.gate.set(LinkState::Closed);
        }
        self.drain_pending();
    }
}
