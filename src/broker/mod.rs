//! Socket broker: the routing hub every remote transport connects to.
//!
//! The broker never decodes payloads. A frame read off one socket is
//! forwarded to other sockets as the exact bytes that arrived, so routing
//! cost does not depend on the payload codec. All routing state lives in a
//! single router task fed by an mpsc queue; per-socket reader tasks feed it
//! in arrival order, so per-connection frame order is preserved end to end
//! and the registry needs no locks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{JsonCodec, PayloadCodec};
use crate::command::{
    encode_frame, read_frame, Command, CommandKind, Peer, ProcessDescriptor, ProcessKind,
    QueryStateSnapshot, WireFrame, QUERY_STATE_CHANNEL,
};
use crate::config::{CloseOptions, ConnectOptions};
use crate::connector::{with_deadline, IoStream, LifecycleGate, LinkState};
use crate::error::{BusError, Result};
use crate::registry::{ChannelNotifier, ChannelsRefCount, ConnId, SubscriptionRegistry};

/// Frames queued per connection before writes start getting dropped.
const WRITE_QUEUE_DEPTH: usize = 256;
/// Router inbox depth; readers block here, which backpressures sockets.
const ROUTER_QUEUE_DEPTH: usize = 1024;

enum RouterMsg {
    Connected {
        conn: ConnId,
        writer: mpsc::Sender<Bytes>,
    },
    Frame {
        conn: ConnId,
        frame: WireFrame,
    },
    Disconnected {
        conn: ConnId,
    },
    Violation {
        conn: ConnId,
        error: BusError,
    },
    Query {
        reply: oneshot::Sender<QueryStateSnapshot>,
    },
    Shutdown,
}

/// Keeps an attached upstream bridge informed of channel presence.
struct UpstreamNotifier {
    writer: mpsc::Sender<Bytes>,
    peer: Peer,
}

impl UpstreamNotifier {
    fn post(&self, kind: CommandKind, channel: &str) {
        let command = Command::new(kind, channel, self.peer.clone());
        match encode_frame(&command, &[]) {
            Ok(raw) => {
                if self.writer.try_send(raw).is_err() {
                    warn!(channel = %channel, "bridge link congested, dropping presence update");
                }
            }
            Err(e) => error!(error = %e, "presence update encode failed"),
        }
    }
}

impl ChannelNotifier for UpstreamNotifier {
    fn channel_added(&self, channel: &str) {
        self.post(CommandKind::BrokerAddChannelListener, channel);
    }

    fn channel_removed(&self, channel: &str) {
        self.post(CommandKind::BrokerRemoveChannelListener, channel);
    }
}

struct BridgeLink {
    conn: ConnId,
    /// Channels the bridge wants forwarded upstream.
    channels: ChannelsRefCount,
}

struct Router {
    peer: Peer,
    codec: Arc<dyn PayloadCodec>,
    registry: SubscriptionRegistry,
    writers: HashMap<ConnId, mpsc::Sender<Bytes>>,
    /// Last connection each peer id was seen on; routes targeted frames.
    endpoints: HashMap<String, ConnId>,
    bridge: Option<BridgeLink>,
}

impl Router {
    fn new(peer: Peer, codec: Arc<dyn PayloadCodec>) -> Self {
        Self {
            peer,
            codec,
            registry: SubscriptionRegistry::new(),
            writers: HashMap::new(),
            endpoints: HashMap::new(),
            bridge: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RouterMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                RouterMsg::Connected { conn, writer } => {
                    debug!(conn, "socket attached");
                    self.writers.insert(conn, writer);
                }
                RouterMsg::Frame { conn, frame } => self.route(conn, frame),
                RouterMsg::Disconnected { conn } => {
                    debug!(conn, "socket detached");
                    self.drop_connection(conn);
                }
                RouterMsg::Violation { conn, error } => {
                    error!(conn, error = %error, "protocol violation, resetting connection");
                    self.drop_connection(conn);
                }
                RouterMsg::Query { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                RouterMsg::Shutdown => break,
            }
        }
        info!("broker router stopped");
    }

    fn route(&mut self, conn: ConnId, frame: WireFrame) {
        let command = &frame.command;
        self.endpoints.insert(command.peer.id.clone(), conn);
        match command.kind {
            CommandKind::Connect => {
                debug!(conn, peer = %command.peer, "peer announced");
            }
            CommandKind::Close => self.drop_connection(conn),

            CommandKind::AddChannelListener => {
                self.registry.add_ref(&command.channel, &command.peer, conn);
            }
            CommandKind::RemoveChannelListener => {
                self.registry.release(&command.channel, &command.peer.id);
            }
            CommandKind::RemoveChannelAllListeners => {
                self.registry.release_all(&command.channel, &command.peer.id);
            }
            CommandKind::RemoveListeners => {
                self.registry.remove_peer(&command.peer.id);
            }

            CommandKind::SendMessage | CommandKind::RequestMessage | CommandKind::RequestCancel => {
                self.route_message(conn, &frame);
            }
            CommandKind::RequestResponse | CommandKind::QueryStateResponse => {
                self.route_targeted(conn, &frame);
            }
            CommandKind::RequestClose
            | CommandKind::LogGetMessage
            | CommandKind::LogLocalSendRequest
            | CommandKind::LogLocalRequestResponse => {
                self.forward_to_bridge(conn, &frame.raw);
            }

            CommandKind::QueryState => {
                self.answer_query_state(conn, command.peer.clone());
                // Subscribers of the reserved channel also see the query.
                self.route_message(conn, &frame);
            }

            CommandKind::BridgeConnect => {
                let mut channels = ChannelsRefCount::new();
                if let Some(declared) = &command.channels {
                    channels.add_refs(declared);
                }
                info!(conn, channels = channels.channels().len(), "bridge attached");
                self.bridge = Some(BridgeLink { conn, channels });
                if let Some(writer) = self.writers.get(&conn).cloned() {
                    let notifier = UpstreamNotifier {
                        writer,
                        peer: self.peer.clone(),
                    };
                    // Replay current presence, then keep the bridge posted.
                    for channel in self.registry.channels() {
                        notifier.post(CommandKind::BrokerAddChannelListener, &channel);
                    }
                    self.registry.set_notifier(Some(Box::new(notifier)));
                }
            }
            CommandKind::BridgeClose => {
                info!(conn, "bridge detached");
                self.bridge = None;
                self.registry.set_notifier(None);
            }
            CommandKind::BridgeAddChannelListener => {
                if let Some(bridge) = &mut self.bridge {
                    bridge.channels.add_ref(&command.channel);
                }
            }
            CommandKind::BridgeRemoveChannelListener => {
                if let Some(bridge) = &mut self.bridge {
                    bridge.channels.release(&command.channel);
                }
            }

            CommandKind::BrokerAddChannelListener | CommandKind::BrokerRemoveChannelListener => {
                warn!(conn, kind = ?command.kind, "downstream-only kind received, ignoring");
            }
        }
    }

    /// Channel fan-out: every subscribed connection except the origin, plus
    /// the bridge when it declared interest.
    fn route_message(&mut self, conn: ConnId, frame: &WireFrame) {
        let command = &frame.command;
        if let Some(target) = &command.target {
            // A known target gets the frame directly. An unknown one may be
            // a client that never spoke yet, so fall back to channel fan-out
            // and let each transport filter by target.
            if let Some(dst) = self.endpoints.get(&target.peer_id).copied() {
                self.write(dst, frame.raw.clone());
                return;
            }
            for dst in self.registry.connections_on(&command.channel) {
                if dst != conn {
                    self.write(dst, frame.raw.clone());
                }
            }
            self.forward_to_bridge(conn, &frame.raw);
            return;
        }
        for dst in self.registry.connections_on(&command.channel) {
            if dst != conn {
                self.write(dst, frame.raw.clone());
            }
        }
        let bridge_wants = self
            .bridge
            .as_ref()
            .map(|b| b.conn != conn && b.channels.has(&command.channel))
            .unwrap_or(false);
        if bridge_wants {
            self.forward_to_bridge(conn, &frame.raw);
        }
    }

    /// Responses carry an explicit target; a miss means the peer lives
    /// beyond the bridge or is gone.
    fn route_targeted(&mut self, conn: ConnId, frame: &WireFrame) {
        let Some(target) = &frame.command.target else {
            debug!(kind = ?frame.command.kind, "untargeted response, dropping");
            return;
        };
        match self.endpoints.get(&target.peer_id).copied() {
            Some(dst) => self.write(dst, frame.raw.clone()),
            None => self.forward_to_bridge(conn, &frame.raw),
        }
    }

    fn forward_to_bridge(&mut self, conn: ConnId, raw: &Bytes) {
        let Some(bridge) = &self.bridge else { return };
        if bridge.conn == conn {
            return;
        }
        let dst = bridge.conn;
        self.write(dst, raw.clone());
    }

    fn answer_query_state(&mut self, conn: ConnId, requester: Peer) {
        let snapshot = self.snapshot();
        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "state snapshot serialization failed");
                return;
            }
        };
        let payload = match self.codec.encode(&[value]) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "state snapshot encode failed");
                return;
            }
        };
        let command = Command::new(
            CommandKind::QueryStateResponse,
            QUERY_STATE_CHANNEL,
            self.peer.clone(),
        )
        .with_target(Some(crate::command::Target::peer(&requester)));
        match encode_frame(&command, &payload) {
            Ok(raw) => self.write(conn, raw),
            Err(e) => error!(error = %e, "state response encode failed"),
        }
    }

    fn write(&mut self, conn: ConnId, raw: Bytes) {
        match self.writers.get(&conn) {
            Some(writer) => {
                if writer.try_send(raw).is_err() {
                    warn!(conn, "write queue full or closed, dropping frame");
                }
            }
            None => debug!(conn, "no writer for connection, dropping frame"),
        }
    }

    fn drop_connection(&mut self, conn: ConnId) {
        self.writers.remove(&conn);
        self.registry.remove_connection(conn);
        self.endpoints.retain(|_, c| *c != conn);
        if self.bridge.as_ref().map(|b| b.conn) == Some(conn) {
            info!(conn, "bridge connection lost");
            self.bridge = None;
            self.registry.set_notifier(None);
        }
    }

    fn snapshot(&self) -> QueryStateSnapshot {
        QueryStateSnapshot {
            endpoint: "broker".to_string(),
            peers: self.registry.peers(),
            channels: self.registry.snapshot(),
        }
    }
}

enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl AnyListener {
    async fn accept(&self) -> std::io::Result<Box<dyn IoStream>> {
        match self {
            AnyListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            AnyListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// A stale socket file from a dead broker is removed; a live one is an
/// address conflict.
async fn prepare_uds_path(path: &Path) -> Result<()> {
    if tokio::fs::metadata(path).await.is_ok() {
        match UnixStream::connect(path).await {
            Ok(_) => {
                return Err(BusError::Connection(format!(
                    "{} already has a listening broker",
                    path.display()
                )))
            }
            Err(_) => tokio::fs::remove_file(path).await?,
        }
    }
    Ok(())
}

/// The listening server side of the bus.
pub struct Broker {
    peer: Peer,
    codec: Arc<dyn PayloadCodec>,
    gate: LifecycleGate,
    router_tx: Mutex<Option<mpsc::Sender<RouterMsg>>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    uds_path: Mutex<Option<PathBuf>>,
    local_port: Mutex<Option<u16>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(JsonCodec))
    }

    /// Broker-originated payloads (state answers) use this codec; routed
    /// traffic is never re-encoded.
    pub fn with_codec(codec: Arc<dyn PayloadCodec>) -> Self {
        let process = ProcessDescriptor::new(ProcessKind::Native);
        let peer = Peer {
            id: format!("{}.broker", process.signature()),
            name: "broker".to_string(),
            process,
        };
        Self {
            peer,
            codec,
            gate: LifecycleGate::new(),
            router_tx: Mutex::new(None),
            router_task: Mutex::new(None),
            accept_task: Mutex::new(None),
            uds_path: Mutex::new(None),
            local_port: Mutex::new(None),
        }
    }

    /// Bind and start accepting. Exactly one of `path`/`port` must be set
    /// in `options`.
    pub async fn start(&self, options: &ConnectOptions) -> Result<()> {
        let Some(_guard) = self.gate.begin_connect().await else {
            return Ok(());
        };
        let bound = self.bind(options).await;
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                self.gate.set(LinkState::Idle);
                return Err(e);
            }
        };

        let (router_tx, router_rx) = mpsc::channel(ROUTER_QUEUE_DEPTH);
        let router =
            tokio::spawn(Router::new(self.peer.clone(), self.codec.clone()).run(router_rx));
        *self.router_task.lock().unwrap() = Some(router);

        let accept_tx = router_tx.clone();
        let handle = tokio::spawn(async move {
            let mut next_conn: ConnId = 0;
            loop {
                let stream = match listener.accept().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(error = %e, "accept loop ending");
                        break;
                    }
                };
                next_conn += 1;
                spawn_connection(next_conn, stream, accept_tx.clone()).await;
            }
        });

        *self.router_tx.lock().unwrap() = Some(router_tx);
        *self.accept_task.lock().unwrap() = Some(handle);
        self.gate.set(LinkState::Connected);
        info!("broker listening");
        Ok(())
    }

    async fn bind(&self, options: &ConnectOptions) -> Result<AnyListener> {
        options.validate_endpoint()?;
        match &options.path {
            Some(path) => {
                prepare_uds_path(path).await?;
                let listener = UnixListener::bind(path)?;
                *self.uds_path.lock().unwrap() = Some(path.clone());
                Ok(AnyListener::Unix(listener))
            }
            None => {
                let listener = TcpListener::bind(options.tcp_addr()).await?;
                *self.local_port.lock().unwrap() = Some(listener.local_addr()?.port());
                Ok(AnyListener::Tcp(listener))
            }
        }
    }

    /// Port actually bound, once listening over TCP. Useful with port 0.
    pub fn local_port(&self) -> Option<u16> {
        *self.local_port.lock().unwrap()
    }

    /// Stop accepting, stop routing, unlink the socket file. The close
    /// deadline bounds how long the router gets to drain; a negative
    /// deadline waits forever.
    pub async fn close(&self, options: &CloseOptions) -> Result<()> {
        let Some(_guard) = self.gate.begin_close().await else {
            return Ok(());
        };
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
        let router_tx = self.router_tx.lock().unwrap().take();
        if let Some(tx) = router_tx {
            let _ = tx.send(RouterMsg::Shutdown).await;
        }
        let router = self.router_task.lock().unwrap().take();
        if let Some(mut router) = router {
            let waited = with_deadline(options.timeout(), async {
                let _ = (&mut router).await;
                Ok(())
            })
            .await;
            if waited.is_err() {
                warn!("close deadline elapsed, aborting router");
                router.abort();
            }
        }
        let uds_path = self.uds_path.lock().unwrap().take();
        if let Some(path) = uds_path {
            let _ = tokio::fs::remove_file(&path).await;
        }
        self.gate.set(LinkState::Closed);
        info!("broker closed");
        Ok(())
    }

    /// Routing-state snapshot, answered by the router task itself.
    pub async fn query_state(&self) -> Result<QueryStateSnapshot> {
        let router_tx = self.router_tx.lock().unwrap().clone();
        let Some(tx) = router_tx else {
            return Err(BusError::Closed);
        };
        let (reply, rx) = oneshot::channel();
        tx.send(RouterMsg::Query { reply })
            .await
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)
    }
}

async fn spawn_connection(conn: ConnId, stream: Box<dyn IoStream>, router_tx: mpsc::Sender<RouterMsg>) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let (wtx, mut wrx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(buf) = wrx.recv().await {
            if let Err(e) = write_half.write_all(&buf).await {
                debug!(conn, error = %e, "socket write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    if router_tx
        .send(RouterMsg::Connected { conn, writer: wtx })
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(frame)) => {
                    if router_tx.send(RouterMsg::Frame { conn, frame }).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = router_tx.send(RouterMsg::Disconnected { conn }).await;
                    return;
                }
                Err(error) => {
                    let _ = router_tx.send(RouterMsg::Violation { conn, error }).await;
                    return;
                }
            }
        }
    });
}
