//! In-process connector: commands cross the seam as structured values and
//! are only serialized if they later leave the process.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error};
use uuid::Uuid;

use super::{Connector, ConnectorSink, Handshake};
use crate::command::{decode_frame, Command, Frame, Payload, ProcessDescriptor, ProcessKind};
use crate::config::{CloseOptions, ConnectOptions};
use crate::error::Result;

/// The other end of a [`PairConnector`]: whoever wired the pair up receives
/// everything the transport posts.
pub trait PairHandler: Send + Sync {
    fn on_command(&self, command: Command, payload: Payload);
}

/// Connector whose far end lives in the same process. The bridge hands one
/// of these to each transport it hosts and injects inbound traffic through
/// [`PairConnector::inject`].
pub struct PairConnector {
    kind: ProcessKind,
    trace_level: u8,
    handler: Mutex<Option<Arc<dyn PairHandler>>>,
    sink: Mutex<Option<Arc<dyn ConnectorSink>>>,
}

impl PairConnector {
    pub fn new(kind: ProcessKind, trace_level: u8) -> Arc<Self> {
        Arc::new(Self {
            kind,
            trace_level,
            handler: Mutex::new(None),
            sink: Mutex::new(None),
        })
    }

    pub fn set_handler(&self, handler: Arc<dyn PairHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Deliver a command into the attached transport.
    pub fn inject(&self, command: Command, payload: Payload) {
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            Some(sink) => sink.on_command(Frame { command, payload }),
            None => debug!(channel = %command.channel, "pair not connected, dropping inject"),
        }
    }
}

#[async_trait]
impl Connector for PairConnector {
    async fn handshake(
        &self,
        sink: Arc<dyn ConnectorSink>,
        _options: &ConnectOptions,
    ) -> Result<Handshake> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(Handshake {
            process: ProcessDescriptor::new(self.kind),
            instance_id: Uuid::new_v4(),
            trace_level: self.trace_level,
        })
    }

    async fn shutdown(&self, _options: &CloseOptions) -> Result<()> {
        self.sink.lock().unwrap().take();
        self.handler.lock().unwrap().take();
        Ok(())
    }

    fn post_command(&self, command: Command, payload: Payload) {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler.on_command(command, payload),
            None => debug!(channel = %command.channel, "pair has no handler, dropping command"),
        }
    }

    fn post_buffer(&self, raw: Bytes) {
        let handler = self.handler.lock().unwrap().clone();
        let Some(handler) = handler else {
            debug!("pair has no handler, dropping buffer");
            return;
        };
        match decode_frame(raw) {
            Ok(wire) => handler.on_command(wire.command, Payload::Encoded(wire.payload)),
            Err(e) => error!(error = %e, "malformed forwarded frame"),
        }
    }
}
