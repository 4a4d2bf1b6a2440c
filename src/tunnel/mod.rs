//! Tunnel layer - multiplexed flows over one stream
//!
//! Provides:
//! - Frame accumulation and the outbound byte queue
//! - Logical connections with half-close and flow control
//! - The sans-I/O protocol engine
//! - Client and server drivers on top of tokio

mod buffer;
mod client;
mod connection;
mod driver;
mod engine;
mod flow;
mod frame;
mod server;

pub use buffer::{Drain, OutboundBuffer};
pub use client::{ClientEvent, ClientTunnel, SettingsApplier};
pub use connection::{ConnectionState, Delivery, LogicalConnection};
pub use engine::{Role, TunnelEngine, TunnelEvent, MAX_DATA_CHUNK};
pub use flow::{DatagramSink, FlowSink, PacketSink, PacketSource, StreamSink};
pub use frame::FrameDecoder;
pub use server::{
    BoxedStream, DirectConnector, IpFlow, PacketGateway, ProxyConnector, ProxyStream, ServerTunnel,
    DEFAULT_CONNECT_TIMEOUT,
};

use crate::protocol::{FlowKind, ProtocolError};
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection {0} already exists")]
    DuplicateConnection(u32),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(u32),

    #[error("Connection {0} is not open yet")]
    NotEstablished(u32),

    #[error("Connection {0} is already open")]
    AlreadyEstablished(u32),

    #[error("Connection {0} is closed for sending")]
    ConnectionClosed(u32),

    #[error("Connection {id} carries {kind:?} traffic")]
    WrongFlowKind { id: u32, kind: FlowKind },

    #[error("Connection identifier 0 is reserved for the tunnel")]
    ReservedIdentifier,

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes read from the transport per call
pub const READ_CHUNK_SIZE: usize = 64 * 1024;
