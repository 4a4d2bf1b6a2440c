//! One multiplexed flow and its half-close state machine
//!
//! "Read" is the direction from the local source into the tunnel, "write"
//! the direction from the tunnel into the local sink. The two close
//! independently; the connection is finished once both are closed and no
//! saved bytes remain for the sink.

use super::buffer::OutboundBuffer;
use super::flow::{FlowSink, StreamSink};
use crate::protocol::{CloseDirection, Datagram, FlowKind, Packet};
use std::io;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open requested, no result yet
    Pending,
    /// Both directions open
    Open,
    /// Local source closed, sink still open
    ReadClosed,
    /// Sink closed, local source still open
    WriteClosed,
    /// Both directions closed
    Closed,
    /// Torn down without a graceful close
    Aborted,
}

/// Outcome of handing inbound stream bytes to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Everything reached the sink, or was saved while pending
    Accepted,
    /// The sink is full; the remainder is saved
    Saturated,
    /// The write direction is closed and the bytes were dropped
    Discarded,
}

/// A logical connection inside one tunnel
#[derive(Debug)]
pub struct LogicalConnection {
    id: u32,
    kind: FlowKind,
    established: bool,
    read_closed: bool,
    write_closed: bool,
    aborted: bool,
    /// Close the sink once `saved` drains
    close_sink_pending: bool,
    /// Inbound bytes the sink could not take yet
    saved: OutboundBuffer,
    sink: Option<FlowSink>,
    /// The peer asked us to stop reading our source
    pub(crate) suspended_by_peer: bool,
    /// We asked the peer to stop reading its source
    pub(crate) suspend_sent: bool,
    /// Last pause state reported to the owner
    pub(crate) source_paused: bool,
}

impl LogicalConnection {
    pub fn new(id: u32, kind: FlowKind) -> Self {
        Self {
            id,
            kind,
            established: false,
            read_closed: false,
            write_closed: false,
            aborted: false,
            close_sink_pending: false,
            saved: OutboundBuffer::new(),
            sink: None,
            suspended_by_peer: false,
            suspend_sent: false,
            source_paused: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        if self.aborted {
            return ConnectionState::Aborted;
        }
        match (self.established, self.read_closed, self.write_closed) {
            (_, true, true) => ConnectionState::Closed,
            (false, _, _) => ConnectionState::Pending,
            (true, true, false) => ConnectionState::ReadClosed,
            (true, false, true) => ConnectionState::WriteClosed,
            (true, false, false) => ConnectionState::Open,
        }
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Bytes waiting for the sink
    pub fn saved_len(&self) -> usize {
        self.saved.len()
    }

    /// Ready to leave the registry
    pub fn is_finished(&self) -> bool {
        self.aborted || (self.read_closed && self.write_closed && self.saved.is_empty())
    }

    pub(crate) fn attach_sink(&mut self, sink: FlowSink) {
        self.sink = Some(sink);
    }

    /// Pending -> Open, flushing anything that arrived early
    pub(crate) fn establish(&mut self) -> io::Result<Delivery> {
        self.established = true;
        if self.saved.is_empty() || self.flush_saved()? {
            Ok(Delivery::Accepted)
        } else {
            Ok(Delivery::Saturated)
        }
    }

    /// Hand inbound stream bytes to the sink
    pub(crate) fn deliver(&mut self, data: &[u8]) -> io::Result<Delivery> {
        if self.write_closed {
            return Ok(Delivery::Discarded);
        }
        if !self.established {
            self.saved.append(data);
            return Ok(Delivery::Accepted);
        }
        // Keep byte order: nothing bypasses bytes already saved
        if !self.saved.is_empty() {
            self.saved.append(data);
            return Ok(Delivery::Saturated);
        }

        let written = write_some(stream_sink(&mut self.sink)?, data)?;
        if written < data.len() {
            self.saved.append(&data[written..]);
            return Ok(Delivery::Saturated);
        }
        Ok(Delivery::Accepted)
    }

    pub(crate) fn deliver_packets(&mut self, packets: Vec<Packet>) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(FlowSink::Packets(sink)) if self.established && !self.write_closed => {
                sink.write_packets(packets)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn deliver_datagram(&mut self, datagram: Datagram) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(FlowSink::Datagrams(sink)) if self.established && !self.write_closed => {
                sink.send_datagram(datagram)
            }
            _ => Ok(()),
        }
    }

    /// Push saved bytes into the sink until it stops accepting
    ///
    /// Returns true when nothing is left.
    pub(crate) fn flush_saved(&mut self) -> io::Result<bool> {
        if !self.saved.is_empty() {
            let sink = stream_sink(&mut self.sink)?;
            while !self.saved.is_empty() {
                let drain = self.saved.drain(|data| write_some(sink, data))?;
                if drain.written == 0 {
                    break;
                }
            }
        }

        let empty = self.saved.is_empty();
        if empty && self.close_sink_pending {
            self.close_sink_pending = false;
            self.close_sink();
        }
        Ok(empty)
    }

    /// Close directions on our own initiative
    ///
    /// Closing write discards saved bytes. Returns the directions that were
    /// still open, if any.
    pub(crate) fn close_local(&mut self, direction: CloseDirection) -> Option<CloseDirection> {
        let closed = self.mark_closed(direction)?;
        if closed.includes_write() {
            self.saved.clear();
            self.close_sink();
        }
        Some(closed)
    }

    /// Close directions at the peer's request
    ///
    /// Closing write lets saved bytes reach the sink first.
    pub(crate) fn close_remote(&mut self, direction: CloseDirection) -> Option<CloseDirection> {
        let closed = self.mark_closed(direction)?;
        if closed.includes_write() {
            if self.saved.is_empty() {
                self.close_sink();
            } else {
                self.close_sink_pending = true;
            }
        }
        Some(closed)
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
        self.read_closed = true;
        self.write_closed = true;
        self.saved.clear();
        self.sink = None;
    }

    fn mark_closed(&mut self, direction: CloseDirection) -> Option<CloseDirection> {
        let read = direction.includes_read() && !self.read_closed;
        let write = direction.includes_write() && !self.write_closed;
        self.read_closed |= read;
        self.write_closed |= write;

        match (read, write) {
            (true, true) => Some(CloseDirection::All),
            (true, false) => Some(CloseDirection::Read),
            (false, true) => Some(CloseDirection::Write),
            (false, false) => None,
        }
    }

    fn close_sink(&mut self) {
        if let Some(FlowSink::Stream(sink)) = self.sink.as_mut() {
            sink.close_write();
        }
        self.sink = None;
    }
}

fn stream_sink(sink: &mut Option<FlowSink>) -> io::Result<&mut Box<dyn StreamSink>> {
    match sink {
        Some(FlowSink::Stream(sink)) => Ok(sink),
        _ => Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection has no stream sink",
        )),
    }
}

fn write_some(sink: &mut Box<dyn StreamSink>, data: &[u8]) -> io::Result<usize> {
    match sink.try_write(data) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}
