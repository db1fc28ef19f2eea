//! Bridge: in-process router over one main transport, any number of frame
//! transports, and an optional socket link to a broker.
//!
//! Traffic between the transports it hosts never leaves the process and is
//! never serialized; only commands crossing the socket link are encoded,
//! and each command is encoded at most once. The bridge presents itself to
//! the broker as a single subscriber: channel interest from all hosted
//! transports is aggregated and only 0↔1 transitions are announced
//! upstream, mirroring what the broker announces back about its own side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::codec::PayloadCodec;
use crate::command::{
    Command, CommandKind, Frame, Payload, Peer, ProcessKind, QueryStateSnapshot,
};
use crate::config::{CloseOptions, ConnectOptions};
use crate::connector::{
    Connector, ConnectorSink, LifecycleGate, LinkState, PairConnector, PairHandler,
    SocketConnector,
};
use crate::error::Result;
use crate::registry::ChannelsRefCount;
use crate::transport::{BusContext, Transport};

/// Where a command entered the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Main,
    Frame(u64),
    Socket,
}

struct FrameSink {
    pair: Arc<PairConnector>,
    /// What this sink subscribed to, learned from listener commands
    /// passing through.
    channels: ChannelsRefCount,
}

struct BridgeInner {
    peer: Peer,
    main_pair: Arc<PairConnector>,
    main_channels: Mutex<ChannelsRefCount>,
    frames: Mutex<HashMap<u64, FrameSink>>,
    /// Union of all hosted transports' interest; drives upstream announcements.
    aggregate: Mutex<ChannelsRefCount>,
    /// What the broker side wants, learned from Broker* announcements.
    broker_channels: Mutex<ChannelsRefCount>,
    /// Last origin each peer id was seen from; routes targeted commands.
    endpoints: Mutex<HashMap<String, Origin>>,
    socket: Mutex<Option<Arc<dyn Connector>>>,
}

impl BridgeInner {
    fn distribute(&self, origin: Origin, command: Command, payload: Payload) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(command.peer.id.clone(), origin);
        match command.kind {
            CommandKind::AddChannelListener => self.interest_added(origin, &command.channel),
            CommandKind::RemoveChannelListener => self.interest_removed(origin, &command.channel),

            CommandKind::SendMessage
            | CommandKind::RequestMessage
            | CommandKind::RequestCancel
            | CommandKind::QueryState => self.route_message(origin, command, payload),

            CommandKind::RequestResponse
            | CommandKind::QueryStateResponse
            | CommandKind::RequestClose => self.route_targeted(origin, command, payload),

            CommandKind::BrokerAddChannelListener => {
                self.broker_channels.lock().unwrap().add_ref(&command.channel);
            }
            CommandKind::BrokerRemoveChannelListener => {
                self.broker_channels.lock().unwrap().release(&command.channel);
            }

            CommandKind::LogGetMessage
            | CommandKind::LogLocalSendRequest
            | CommandKind::LogLocalRequestResponse => {
                if origin != Origin::Socket {
                    self.send_socket(command, payload);
                }
            }

            CommandKind::Connect | CommandKind::Close => {
                debug!(origin = ?origin, kind = ?command.kind, "lifecycle command observed");
            }

            _ => debug!(kind = ?command.kind, "kind not routed by bridge"),
        }
    }

    /// Untargeted fan-out: every interested hosted transport except the
    /// origin, plus the socket when the broker side cares. Request cancels
    /// and state queries cross the socket unconditionally.
    fn route_message(&self, origin: Origin, command: Command, payload: Payload) {
        if command.target.is_some() {
            return self.route_targeted(origin, command, payload);
        }
        let mut local: Vec<Arc<PairConnector>> = Vec::new();
        if origin != Origin::Main && self.main_channels.lock().unwrap().has(&command.channel) {
            local.push(self.main_pair.clone());
        }
        {
            let frames = self.frames.lock().unwrap();
            for (id, sink) in frames.iter() {
                if origin != Origin::Frame(*id) && sink.channels.has(&command.channel) {
                    local.push(sink.pair.clone());
                }
            }
        }
        let always_socket = matches!(
            command.kind,
            CommandKind::RequestCancel | CommandKind::QueryState
        );
        let to_socket = origin != Origin::Socket
            && (always_socket || self.broker_channels.lock().unwrap().has(&command.channel));

        for pair in local {
            pair.inject(command.clone(), payload.clone());
        }
        if to_socket {
            self.send_socket(command, payload);
        }
    }

    fn route_targeted(&self, origin: Origin, command: Command, payload: Payload) {
        let dest = command
            .target
            .as_ref()
            .and_then(|t| self.endpoints.lock().unwrap().get(&t.peer_id).copied());
        match dest {
            Some(Origin::Main) => self.main_pair.inject(command, payload),
            Some(Origin::Frame(id)) => {
                let pair = self.frames.lock().unwrap().get(&id).map(|s| s.pair.clone());
                match pair {
                    Some(pair) => pair.inject(command, payload),
                    None => debug!("frame sink gone, dropping targeted command"),
                }
            }
            Some(Origin::Socket) => {
                if origin != Origin::Socket {
                    self.send_socket(command, payload);
                }
            }
            None => {
                // Unknown peers may live beyond the broker.
                if origin != Origin::Socket {
                    self.send_socket(command, payload);
                } else {
                    debug!(channel = %command.channel, "target unknown, dropping");
                }
            }
        }
    }

    fn interest_added(&self, origin: Origin, channel: &str) {
        match origin {
            Origin::Main => {
                self.main_channels.lock().unwrap().add_ref(channel);
            }
            Origin::Frame(id) => {
                if let Some(sink) = self.frames.lock().unwrap().get_mut(&id) {
                    sink.channels.add_ref(channel);
                }
            }
            Origin::Socket => return,
        }
        if self.aggregate.lock().unwrap().add_ref(channel) {
            let command = Command::new(
                CommandKind::BridgeAddChannelListener,
                channel,
                self.peer.clone(),
            );
            self.send_socket(command, Payload::None);
        }
    }

    fn interest_removed(&self, origin: Origin, channel: &str) {
        match origin {
            Origin::Main => {
                self.main_channels.lock().unwrap().release(channel);
            }
            Origin::Frame(id) => {
                if let Some(sink) = self.frames.lock().unwrap().get_mut(&id) {
                    sink.channels.release(channel);
                }
            }
            Origin::Socket => return,
        }
        if self.aggregate.lock().unwrap().release(channel) {
            let command = Command::new(
                CommandKind::BridgeRemoveChannelListener,
                channel,
                self.peer.clone(),
            );
            self.send_socket(command, Payload::None);
        }
    }

    /// The one place serialization can happen: the connector encodes the
    /// payload while building the frame.
    fn send_socket(&self, command: Command, payload: Payload) {
        let socket = self.socket.lock().unwrap().clone();
        if let Some(socket) = socket {
            socket.post_command(command, payload);
        }
    }
}

struct MainHandler {
    inner: Weak<BridgeInner>,
}

impl PairHandler for MainHandler {
    fn on_command(&self, command: Command, payload: Payload) {
        if let Some(inner) = self.inner.upgrade() {
            inner.distribute(Origin::Main, command, payload);
        }
    }
}

struct FrameHandler {
    inner: Weak<BridgeInner>,
    id: u64,
}

impl PairHandler for FrameHandler {
    fn on_command(&self, command: Command, payload: Payload) {
        if let Some(inner) = self.inner.upgrade() {
            inner.distribute(Origin::Frame(self.id), command, payload);
        }
    }
}

struct SocketSink {
    inner: Weak<BridgeInner>,
}

impl ConnectorSink for SocketSink {
    fn on_command(&self, frame: Frame) {
        if let Some(inner) = self.inner.upgrade() {
            inner.distribute(Origin::Socket, frame.command, frame.payload);
        }
    }

    fn on_shutdown(&self) {
        warn!("bridge socket link dropped");
        if let Some(inner) = self.inner.upgrade() {
            inner.socket.lock().unwrap().take();
            inner.broker_channels.lock().unwrap().clear();
        }
    }
}

/// Hosts transports in one process and stitches them to each other and to
/// a broker.
pub struct Bridge {
    context: Arc<BusContext>,
    codec: Arc<dyn PayloadCodec>,
    inner: Arc<BridgeInner>,
    main: Arc<Transport>,
    frame_transports: Mutex<Vec<Arc<Transport>>>,
    broker: Mutex<Option<Arc<Broker>>>,
    gate: LifecycleGate,
    next_frame: AtomicU64,
}

impl Bridge {
    pub fn new(context: Arc<BusContext>, codec: Arc<dyn PayloadCodec>) -> Arc<Self> {
        let main_pair = PairConnector::new(ProcessKind::Main, 0);
        let inner = Arc::new(BridgeInner {
            peer: context.mint_peer(Some("bridge")),
            main_pair: main_pair.clone(),
            main_channels: Mutex::new(ChannelsRefCount::new()),
            frames: Mutex::new(HashMap::new()),
            aggregate: Mutex::new(ChannelsRefCount::new()),
            broker_channels: Mutex::new(ChannelsRefCount::new()),
            endpoints: Mutex::new(HashMap::new()),
            socket: Mutex::new(None),
        });
        main_pair.set_handler(Arc::new(MainHandler {
            inner: Arc::downgrade(&inner),
        }));
        let main = Transport::new(context.clone(), main_pair, codec.clone());
        Arc::new(Self {
            context,
            codec,
            inner,
            main,
            frame_transports: Mutex::new(Vec::new()),
            broker: Mutex::new(None),
            gate: LifecycleGate::new(),
            next_frame: AtomicU64::new(0),
        })
    }

    /// The host process's own endpoint.
    pub fn main_transport(&self) -> Arc<Transport> {
        self.main.clone()
    }

    /// Attach another in-process endpoint (e.g. one per hosted frame).
    pub async fn add_frame_transport(&self, name: &str) -> Result<Arc<Transport>> {
        let id = self.next_frame.fetch_add(1, Ordering::Relaxed) + 1;
        let pair = PairConnector::new(ProcessKind::Renderer, 0);
        pair.set_handler(Arc::new(FrameHandler {
            inner: Arc::downgrade(&self.inner),
            id,
        }));
        self.inner.frames.lock().unwrap().insert(
            id,
            FrameSink {
                pair: pair.clone(),
                channels: ChannelsRefCount::new(),
            },
        );
        let transport = Transport::new(self.context.clone(), pair, self.codec.clone());
        transport.connect(&ConnectOptions::default()).await?;
        self.frame_transports.lock().unwrap().push(transport.clone());
        info!(name, "frame transport attached");
        Ok(transport)
    }

    /// Bring the bridge up. With a socket endpoint in `options` it links to
    /// a broker; with `server` set it starts an embedded one first and
    /// loops back to it.
    pub async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        let Some(_guard) = self.gate.begin_connect().await else {
            return Ok(());
        };
        if let Err(e) = self.main.connect(&ConnectOptions::default()).await {
            self.gate.set(LinkState::Idle);
            return Err(e);
        }
        if options.path.is_some() || options.port.is_some() {
            let outcome = self.link_broker(options).await;
            if let Err(e) = outcome {
                self.gate.set(LinkState::Idle);
                return Err(e);
            }
        }
        self.gate.set(LinkState::Connected);
        info!(peer = %self.inner.peer, "bridge up");
        Ok(())
    }

    async fn link_broker(&self, options: &ConnectOptions) -> Result<()> {
        let mut dial = options.clone();
        if options.server {
            let broker = Arc::new(Broker::with_codec(self.codec.clone()));
            broker.start(options).await?;
            if options.port == Some(0) {
                dial.port = broker.local_port();
            }
            *self.broker.lock().unwrap() = Some(broker);
        }
        let socket: Arc<dyn Connector> =
            Arc::new(SocketConnector::new(ProcessKind::Main, self.codec.clone()));
        self.attach_socket(socket, &dial).await
    }

    async fn attach_socket(
        &self,
        socket: Arc<dyn Connector>,
        options: &ConnectOptions,
    ) -> Result<()> {
        let sink: Arc<dyn ConnectorSink> = Arc::new(SocketSink {
            inner: Arc::downgrade(&self.inner),
        });
        socket.handshake(sink, options).await?;
        *self.inner.socket.lock().unwrap() = Some(socket.clone());
        // Declare all current interest in one round trip.
        let mut command = Command::new(CommandKind::BridgeConnect, "", self.inner.peer.clone());
        command.channels = Some(self.inner.aggregate.lock().unwrap().channels());
        socket.post_command(command, Payload::None);
        Ok(())
    }

    pub async fn close(&self, options: &CloseOptions) -> Result<()> {
        let Some(_guard) = self.gate.begin_close().await else {
            return Ok(());
        };
        let socket = self.inner.socket.lock().unwrap().take();
        if let Some(socket) = socket {
            let goodbye = Command::new(CommandKind::BridgeClose, "", self.inner.peer.clone());
            socket.post_command(goodbye, Payload::None);
            socket.shutdown(options).await?;
        }
        let frames: Vec<Arc<Transport>> =
            self.frame_transports.lock().unwrap().drain(..).collect();
        let closed = futures::future::join_all(frames.iter().map(|t| t.close(options))).await;
        for outcome in closed {
            if let Err(e) = outcome {
                warn!(error = %e, "frame transport close failed");
            }
        }
        self.main.close(options).await?;
        let broker = self.broker.lock().unwrap().take();
        if let Some(broker) = broker {
            broker.close(options).await?;
        }
        self.gate.set(LinkState::Closed);
        info!("bridge closed");
        Ok(())
    }

    /// The embedded broker, when running with `server` set.
    pub fn embedded_broker(&self) -> Option<Arc<Broker>> {
        self.broker.lock().unwrap().clone()
    }

    /// Bridge-level state snapshot: aggregated channel interest.
    pub fn query_snapshot(&self) -> QueryStateSnapshot {
        QueryStateSnapshot {
            endpoint: "bridge".to_string(),
            peers: vec![self.inner.peer.clone()],
            channels: self.inner.aggregate.lock().unwrap().snapshot(),
        }
    }
}
