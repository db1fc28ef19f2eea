//! Interbus - cross-process message bus
//!
//! A publish/subscribe bus with request/response semantics. Clients attach
//! to a shared per-process transport, a broker routes frames between
//! processes over TCP or Unix domain sockets, and a bridge stitches
//! multiple in-process transports to each other and to a broker without
//! re-serializing local traffic.

pub mod bridge;
pub mod broker;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connector;
pub mod error;
pub mod registry;
pub mod transport;

pub use bridge::Bridge;
pub use broker::Broker;
pub use client::BusClient;
pub use command::{Peer, ProcessKind, QueryStateSnapshot, Target};
pub use config::{CloseOptions, ConnectOptions};
pub use error::{BusError, RequestError, RequestResponse, Result};
pub use transport::{BusContext, BusEvent, Transport};
