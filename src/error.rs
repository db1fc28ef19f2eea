//! Error taxonomy for bus operations.
//!
//! Routing misses (target peer gone, channel without subscribers) and
//! duplicate request settlements are silent by design and have no variant
//! here; see the broker and transport modules for where they are dropped.

use serde_json::Value;

use crate::command::Peer;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out after {0} ms")]
    Timeout(i64),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("bus endpoint is closed")]
    Closed,

    #[error("invalid options: {0}")]
    Options(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Successful outcome of a request.
#[derive(Debug, Clone)]
pub struct RequestResponse {
    /// Channel the request was issued on.
    pub channel: String,
    /// Peer that answered.
    pub sender: Peer,
    /// Payload passed to the remote `resolve`.
    pub payload: Value,
}

/// Failed outcome of a request.
///
/// `err` is the JSON string `"timeout"`, `"unknown format"`, or whatever the
/// remote handler passed to `reject`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("request on '{channel}' failed: {err}")]
pub struct RequestError {
    pub channel: String,
    pub sender: Option<Peer>,
    pub err: Value,
}

impl RequestError {
    pub(crate) fn timeout(channel: impl Into<String>, sender: Option<Peer>) -> Self {
        Self {
            channel: channel.into(),
            sender,
            err: Value::String("timeout".to_string()),
        }
    }

    /// True when the request failed because its deadline elapsed (or the
    /// connection dropped, which settles the same way).
    pub fn is_timeout(&self) -> bool {
        self.err.as_str() == Some("timeout")
    }
}
