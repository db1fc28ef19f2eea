//! Pluggable payload codec.
//!
//! Envelopes are always JSON (brokers must parse them to route); the codec
//! only governs the out-of-band argument payload. The default is JSON, but
//! any byte-buffer representation can be plugged in at the seam.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{BusError, Result};

/// Encodes and decodes the argument list carried out of band with each
/// command envelope.
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, args: &[Value]) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>>;
}

/// Default codec: the argument list as a JSON array.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, args: &[Value]) -> Result<Bytes> {
        let bytes = serde_json::to_vec(args).map_err(|e| BusError::Codec(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Codec(e.to_string()))
    }
}
