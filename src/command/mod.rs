//! Wire data model: command envelopes, peers, targets and frame layout.
//!
//! A frame on the wire is two length-prefixed sections:
//!
//! ```text
//! [u32 BE envelope len][envelope JSON][u32 BE payload len][payload bytes]
//! ```
//!
//! The envelope is always JSON so a broker can route a frame without knowing
//! the payload codec; the payload section is opaque bytes produced by the
//! configured [`PayloadCodec`](crate::codec::PayloadCodec). Zero payload
//! length means no arguments.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::PayloadCodec;
use crate::error::{BusError, Result};

/// Reserved channel for bus-internal state queries.
pub const QUERY_STATE_CHANNEL: &str = "/interbus/query-state";

/// Upper bound for a single frame section; larger frames are a protocol
/// violation.
pub const MAX_SECTION_LEN: usize = 16 * 1024 * 1024;

/// Closed enumeration of wire command kinds, used as the dispatch key
/// everywhere. Adding a kind is a compile-time-checked decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Connect,
    Close,
    SendMessage,
    RequestMessage,
    RequestResponse,
    RequestClose,
    RequestCancel,
    AddChannelListener,
    RemoveChannelListener,
    RemoveChannelAllListeners,
    RemoveListeners,
    QueryState,
    QueryStateResponse,
    BridgeConnect,
    BridgeClose,
    BridgeAddChannelListener,
    BridgeRemoveChannelListener,
    BrokerAddChannelListener,
    BrokerRemoveChannelListener,
    LogGetMessage,
    LogLocalSendRequest,
    LogLocalRequestResponse,
}

/// Kind of process a peer runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Native,
    Node,
    Main,
    Renderer,
    Worker,
    #[default]
    Undefined,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessKind::Native => "native",
            ProcessKind::Node => "node",
            ProcessKind::Main => "main",
            ProcessKind::Renderer => "renderer",
            ProcessKind::Worker => "worker",
            ProcessKind::Undefined => "undefined",
        };
        f.write_str(s)
    }
}

/// Descriptor of the OS process a peer belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub kind: ProcessKind,
    pub pid: u32,
    /// Sub-addressing inside the process (e.g. a GUI frame id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
}

impl ProcessDescriptor {
    pub fn new(kind: ProcessKind) -> Self {
        Self {
            kind,
            pid: std::process::id(),
            frame: None,
        }
    }

    /// Static part of a peer id: `{kind}-{pid}`.
    pub fn signature(&self) -> String {
        format!("{}-{}", self.kind, self.pid)
    }
}

/// Identity of one client endpoint of the bus. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique within the bus instance: `{kind}-{pid}.{seq}`.
    pub id: String,
    /// Human label, defaults to the id.
    pub name: String,
    pub process: ProcessDescriptor,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Signature naming exactly one destination peer, bypassing channel fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub peer_id: String,
}

impl Target {
    pub fn peer(peer: &Peer) -> Self {
        Self {
            peer_id: peer.id.clone(),
        }
    }
}

/// Correlation data carried by request/response envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRef {
    /// Globally-unique request id.
    pub id: String,
    /// Channel the request was originally issued on.
    pub channel: String,
}

/// Trace metadata, only populated when tracing is negotiated on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamp {
    pub id: String,
    pub timestamp_ms: i64,
    pub local: bool,
}

/// The unit transmitted on the wire. The argument payload travels out of
/// band (second frame section), never inside the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub channel: String,
    pub peer: Peer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stamp: Option<Stamp>,
    /// Channel list carried by `BridgeConnect` so an attaching bridge can
    /// declare its interest in one round trip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
}

impl Command {
    pub fn new(kind: CommandKind, channel: impl Into<String>, peer: Peer) -> Self {
        Self {
            kind,
            channel: channel.into(),
            peer,
            target: None,
            request: None,
            stamp: None,
            channels: None,
        }
    }

    pub fn with_target(mut self, target: Option<Target>) -> Self {
        self.target = target;
        self
    }

    pub fn with_request(mut self, request: RequestRef) -> Self {
        self.request = Some(request);
        self
    }
}

/// Argument payload attached to a command, in whichever form it currently
/// exists. In-process links pass `Args` without ever serializing; socket
/// links carry `Encoded` codec output.
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Args(Arc<Vec<Value>>),
    Encoded(Bytes),
}

impl Payload {
    /// Materialize the argument list, decoding at most once.
    pub fn args(&self, codec: &dyn PayloadCodec) -> Result<Arc<Vec<Value>>> {
        match self {
            Payload::None => Ok(Arc::new(Vec::new())),
            Payload::Args(args) => Ok(args.clone()),
            Payload::Encoded(bytes) => {
                if bytes.is_empty() {
                    Ok(Arc::new(Vec::new()))
                } else {
                    Ok(Arc::new(codec.decode(bytes)?))
                }
            }
        }
    }
}

/// One decoded inbound unit: envelope plus its still-opaque payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub command: Command,
    pub payload: Payload,
}

/// Serialize a full wire frame from an envelope and an already-encoded
/// payload section.
pub fn encode_frame(command: &Command, payload: &[u8]) -> Result<Bytes> {
    let envelope = serde_json::to_vec(command).map_err(|e| BusError::Codec(e.to_string()))?;
    if envelope.len() > MAX_SECTION_LEN || payload.len() > MAX_SECTION_LEN {
        return Err(BusError::Protocol(format!(
            "frame section too large: envelope {}, payload {}",
            envelope.len(),
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(8 + envelope.len() + payload.len());
    buf.put_u32(envelope.len() as u32);
    buf.put_slice(&envelope);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse a full wire frame from an in-memory buffer. Used where the frame
/// already arrived as one contiguous allocation.
pub fn decode_frame(raw: Bytes) -> Result<WireFrame> {
    let parse_len = |buf: &[u8], at: usize| -> Result<usize> {
        if buf.len() < at + 4 {
            return Err(BusError::Protocol("truncated frame".to_string()));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[at..at + 4]);
        Ok(u32::from_be_bytes(len) as usize)
    };
    let envelope_len = parse_len(&raw, 0)?;
    if envelope_len == 0 || envelope_len > MAX_SECTION_LEN {
        return Err(BusError::Protocol(format!(
            "envelope length {envelope_len} out of bounds"
        )));
    }
    if raw.len() < 4 + envelope_len + 4 {
        return Err(BusError::Protocol("truncated frame".to_string()));
    }
    let payload_len = parse_len(&raw, 4 + envelope_len)?;
    if raw.len() != 8 + envelope_len + payload_len {
        return Err(BusError::Protocol("frame length mismatch".to_string()));
    }
    let command: Command = serde_json::from_slice(&raw[4..4 + envelope_len])
        .map_err(|e| BusError::Protocol(format!("bad envelope: {e}")))?;
    let payload = raw.slice(8 + envelope_len..);
    Ok(WireFrame {
        command,
        payload,
        raw,
    })
}

/// A wire frame as read off a socket. `raw` is the exact bytes that can be
/// forwarded to another socket without re-serialization.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub command: Command,
    pub payload: Bytes,
    pub raw: Bytes,
}

/// Read one frame off a stream. Returns `Ok(None)` on clean EOF at a frame
/// boundary; mid-frame EOF and malformed envelopes are protocol errors.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let envelope_len = u32::from_be_bytes(len_buf) as usize;
    if envelope_len == 0 || envelope_len > MAX_SECTION_LEN {
        return Err(BusError::Protocol(format!(
            "envelope length {envelope_len} out of bounds"
        )));
    }
    let mut envelope = vec![0u8; envelope_len];
    reader.read_exact(&mut envelope).await?;

    reader.read_exact(&mut len_buf).await?;
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > MAX_SECTION_LEN {
        return Err(BusError::Protocol(format!(
            "payload length {payload_len} out of bounds"
        )));
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    let command: Command = serde_json::from_slice(&envelope)
        .map_err(|e| BusError::Protocol(format!("bad envelope: {e}")))?;

    let mut raw = BytesMut::with_capacity(8 + envelope_len + payload_len);
    raw.put_u32(envelope_len as u32);
    raw.put_slice(&envelope);
    raw.put_u32(payload_len as u32);
    raw.put_slice(&payload);

    Ok(Some(WireFrame {
        command,
        payload: Bytes::from(payload),
        raw: raw.freeze(),
    }))
}

/// Channel subscriber count, as reported by state queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCount {
    pub channel: String,
    pub refcount: u32,
}

/// Diagnostic snapshot returned over the reserved query-state channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStateSnapshot {
    /// Which component answered: "transport", "broker" or "bridge".
    pub endpoint: String,
    pub peers: Vec<Peer>,
    pub channels: Vec<ChannelCount>,
}
