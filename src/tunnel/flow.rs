//! Endpoints a logical connection moves data between
//!
//! The engine never blocks on these. Sinks are written synchronously and
//! report fullness; sources are pulled by the async drivers.

use crate::protocol::{Datagram, FlowKind, Packet};
use async_trait::async_trait;
use std::fmt;
use std::io;

/// Non-blocking writer for proxied stream bytes
pub trait StreamSink: Send {
    /// Accept a prefix of `data`
    ///
    /// `Ok(0)` or `WouldBlock` means the sink is full; the driver calls
    /// `TunnelEngine::sink_writable` once it has room again.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// No more bytes will follow
    fn close_write(&mut self);
}

/// Injects IP packets into the local network stack
pub trait PacketSink: Send {
    fn write_packets(&mut self, packets: Vec<Packet>) -> io::Result<()>;
}

/// Sends UDP datagrams to their remote address
pub trait DatagramSink: Send {
    fn send_datagram(&mut self, datagram: Datagram) -> io::Result<()>;
}

/// Reads IP packets captured from the local network stack
#[async_trait]
pub trait PacketSource: Send {
    /// Next batch of packets; an empty batch means the source is exhausted
    async fn read_packets(&mut self) -> io::Result<Vec<Packet>>;
}

/// The inbound side of a logical connection
pub enum FlowSink {
    Stream(Box<dyn StreamSink>),
    Packets(Box<dyn PacketSink>),
    Datagrams(Box<dyn DatagramSink>),
}

impl FlowSink {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowSink::Stream(_) => FlowKind::Tcp,
            FlowSink::Packets(_) => FlowKind::Ip,
            FlowSink::Datagrams(_) => FlowKind::Udp,
        }
    }
}

impl fmt::Debug for FlowSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FlowSink").field(&self.kind()).finish()
    }
}
