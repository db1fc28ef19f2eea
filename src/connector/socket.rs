//! Socket-backed connector: length-prefixed frames over TCP or a Unix
//! domain socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{with_deadline, Connector, ConnectorSink, Handshake, IoStream, LifecycleGate, LinkState};
use crate::codec::PayloadCodec;
use crate::command::{encode_frame, read_frame, Command, Frame, Payload, ProcessDescriptor, ProcessKind};
use crate::config::{CloseOptions, ConnectOptions, TRACE_LEVEL_ENV_VAR};
use crate::error::{BusError, Result};

/// Frames queued per link before writes start getting dropped.
const WRITE_QUEUE_DEPTH: usize = 256;

/// Client side of a broker socket. One reader task turns inbound frames
/// into sink calls; one writer task drains a bounded queue so a stalled
/// socket cannot grow unbounded buffers.
pub struct SocketConnector {
    kind: ProcessKind,
    codec: Arc<dyn PayloadCodec>,
    gate: LifecycleGate,
    writer: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped per handshake; a reader outliving its link must not report
    /// shutdown against the link that replaced it.
    generation: Arc<AtomicU64>,
    last_handshake: Mutex<Option<Handshake>>,
}

impl SocketConnector {
    pub fn new(kind: ProcessKind, codec: Arc<dyn PayloadCodec>) -> Self {
        Self {
            kind,
            codec,
            gate: LifecycleGate::new(),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            last_handshake: Mutex::new(None),
        }
    }

    fn enqueue(&self, raw: Bytes) {
        let writer = self.writer.lock().unwrap().clone();
        match writer {
            Some(tx) => {
                if tx.try_send(raw).is_err() {
                    warn!("write queue full or link gone, dropping frame");
                }
            }
            None => debug!("link down, dropping frame"),
        }
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn handshake(
        &self,
        sink: Arc<dyn ConnectorSink>,
        options: &ConnectOptions,
    ) -> Result<Handshake> {
        let Some(_guard) = self.gate.begin_connect().await else {
            // Coalesced with an earlier successful connect.
            let existing = self.last_handshake.lock().unwrap().clone();
            return existing.ok_or(BusError::Closed);
        };
        if let Err(e) = options.validate_endpoint() {
            self.gate.set(LinkState::Idle);
            return Err(e);
        }
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let dial = async {
            let stream: Box<dyn IoStream> = match &options.path {
                Some(path) => Box::new(UnixStream::connect(path).await.map_err(|e| {
                    BusError::Connection(format!("{}: {e}", path.display()))
                })?),
                None => {
                    let addr = options.tcp_addr();
                    Box::new(
                        TcpStream::connect(&addr)
                            .await
                            .map_err(|e| BusError::Connection(format!("{addr}: {e}")))?,
                    )
                }
            };
            Ok(stream)
        };
        let stream = match with_deadline(options.timeout(), dial).await {
            Ok(stream) => stream,
            Err(e) => {
                self.gate.set(LinkState::Idle);
                return Err(e);
            }
        };
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
        *self.writer.lock().unwrap() = Some(tx);

        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if let Err(e) = write_half.write_all(&buf).await {
                    debug!(error = %e, "socket write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let generation = self.generation.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(wire)) => sink.on_command(Frame {
                        command: wire.command,
                        payload: Payload::Encoded(wire.payload),
                    }),
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "inbound frame error, dropping link");
                        break;
                    }
                }
            }
            if generation.load(Ordering::SeqCst) == gen {
                sink.on_shutdown();
            }
        });
        *self.reader_task.lock().unwrap() = Some(reader);

        let trace_level = std::env::var(TRACE_LEVEL_ENV_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let handshake = Handshake {
            process: ProcessDescriptor::new(self.kind),
            instance_id: Uuid::new_v4(),
            trace_level,
        };
        *self.last_handshake.lock().unwrap() = Some(handshake.clone());
        self.gate.set(LinkState::Connected);
        info!(process = %handshake.process.signature(), "bus link established");
        Ok(handshake)
    }

    async fn shutdown(&self, options: &CloseOptions) -> Result<()> {
        let Some(_guard) = self.gate.begin_close().await else {
            return Ok(());
        };
        // Dropping the sender ends the writer task, which flushes the queue
        // and half-closes the socket; the far side finishes the close, which
        // lands as EOF at our reader. Wait for that up to the deadline, then
        // force the teardown. A negative deadline waits forever.
        self.writer.lock().unwrap().take();
        let reader = self.reader_task.lock().unwrap().take();
        if let Some(mut reader) = reader {
            let waited = with_deadline(options.timeout(), async {
                let _ = (&mut reader).await;
                Ok(())
            })
            .await;
            if waited.is_err() {
                warn!("close deadline elapsed, dropping link");
                reader.abort();
            }
        }
        self.gate.set(LinkState::Closed);
        info!("bus link closed");
        Ok(())
    }

    fn post_command(&self, command: Command, payload: Payload) {
        let encoded = match &payload {
            Payload::None => Bytes::new(),
            Payload::Args(args) => match self.codec.encode(args) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, channel = %command.channel, "payload encode failed");
                    return;
                }
            },
            Payload::Encoded(bytes) => bytes.clone(),
        };
        match encode_frame(&command, &encoded) {
            Ok(raw) => self.enqueue(raw),
            Err(e) => error!(error = %e, "envelope encode failed"),
        }
    }

    fn post_buffer(&self, raw: Bytes) {
        self.enqueue(raw);
    }
}
