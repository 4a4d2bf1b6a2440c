//! Protocol state machine for one physical tunnel
//!
//! The engine does no I/O. Drivers feed it transport bytes with
//! [`TunnelEngine::receive`], write out [`TunnelEngine::pending_output`] and
//! report progress with [`TunnelEngine::output_written`], then act on the
//! [`TunnelEvent`]s it queues.

use super::buffer::OutboundBuffer;
use super::connection::{Delivery, LogicalConnection};
use super::flow::FlowSink;
use super::frame::FrameDecoder;
use super::TunnelError;
use crate::protocol::{
    CloseDirection, Command, Datagram, FlowKind, Map, Message, OpenRequest, OpenResult, Packet,
    TUNNEL_CONNECTION_ID,
};
use crate::settings::ServerSettings;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Largest `data` payload per message
pub const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Packet bytes batched into one `packets` message
const MAX_PACKET_BATCH: usize = 64 * 1024;

/// Queued output that pauses every source even before a write falls short
pub const OUTPUT_HIGH_WATER: usize = 4 * crate::protocol::MAX_MESSAGE_SIZE;

/// Which end of the tunnel this engine runs
#[derive(Debug, Clone)]
pub enum Role {
    Client,
    Server(Arc<ServerSettings>),
}

/// Notifications for the engine's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The peer wants a new flow; answer with `accept_open` or `reject_open`
    OpenRequested { id: u32, request: OpenRequest },
    /// The peer answered one of our opens
    OpenCompleted {
        id: u32,
        result: OpenResult,
        configuration: Option<Map>,
    },
    /// Reply to `fetch_configuration`
    ConfigurationReceived(Map),
    /// Stop reading the local source of this connection
    PauseSource { id: u32 },
    /// Reading the local source may continue
    ResumeSource { id: u32 },
    /// The peer will take no more data from this connection's source
    SourceClosed { id: u32 },
    /// Both directions closed; the connection is gone
    ConnectionClosed { id: u32 },
    /// The connection was torn down
    ConnectionAborted { id: u32, reason: String },
}

/// Tunnel protocol engine
pub struct TunnelEngine {
    role: Role,
    connections: HashMap<u32, LogicalConnection>,
    decoder: FrameDecoder,
    /// Single FIFO of encoded frames for every connection
    output: OutboundBuffer,
    /// The transport lags behind `output`
    output_saturated: bool,
    events: Vec<TunnelEvent>,
    last_error: Option<String>,
    closed: bool,
}

impl TunnelEngine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            connections: HashMap::new(),
            decoder: FrameDecoder::new(),
            output: OutboundBuffer::new(),
            output_saturated: false,
            events: Vec::new(),
            last_error: None,
            closed: false,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server(settings: Arc<ServerSettings>) -> Self {
        Self::new(Role::Server(settings))
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Ask the peer for a new flow
    ///
    /// The connection stays pending until the peer's `openResult` arrives.
    pub fn open_connection(
        &mut self,
        id: u32,
        request: OpenRequest,
        sink: FlowSink,
    ) -> Result<(), TunnelError> {
        self.ensure_running()?;
        if id == TUNNEL_CONNECTION_ID {
            return Err(TunnelError::ReservedIdentifier);
        }
        if self.connections.contains_key(&id) {
            return Err(TunnelError::DuplicateConnection(id));
        }

        self.queue(&Message::open(id, &request))?;
        let mut connection = LogicalConnection::new(id, request.kind());
        connection.attach_sink(sink);
        self.connections.insert(id, connection);
        debug!("Opening connection {} ({:?})", id, request);
        Ok(())
    }

    /// Accept a pending open from the peer
    pub fn accept_open(
        &mut self,
        id: u32,
        sink: FlowSink,
        configuration: Option<Map>,
    ) -> Result<(), TunnelError> {
        self.ensure_running()?;
        let connection = self.pending_mut(id)?;
        connection.attach_sink(sink);
        let delivery = connection.establish();

        self.queue(&Message::open_result(id, OpenResult::Success, configuration))?;
        debug!("Connection {} open", id);
        match delivery {
            Ok(Delivery::Saturated) => self.request_suspend(id)?,
            Ok(_) => {}
            Err(e) => self.abort_connection(id, e.to_string())?,
        }
        self.update_pause(id);
        Ok(())
    }

    /// Refuse a pending open from the peer
    pub fn reject_open(&mut self, id: u32, result: OpenResult) -> Result<(), TunnelError> {
        self.ensure_running()?;
        self.pending_mut(id)?;
        self.connections.remove(&id);
        debug!("Connection {} rejected: {:?}", id, result);
        self.queue(&Message::open_result(id, result, None))
    }

    /// Send stream bytes read from a TCP source
    pub fn send_data(&mut self, id: u32, data: Bytes) -> Result<(), TunnelError> {
        self.ensure_sendable(id, FlowKind::Tcp)?;
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_DATA_CHUNK).min(data.len());
            self.queue(&Message::data(id, data.slice(offset..end)))?;
            offset = end;
        }
        Ok(())
    }

    /// Send one UDP datagram
    pub fn send_datagram(&mut self, id: u32, datagram: &Datagram) -> Result<(), TunnelError> {
        self.ensure_sendable(id, FlowKind::Udp)?;
        self.queue(&Message::datagram(id, datagram))
    }

    /// Send captured IP packets, batched into as few messages as fit
    pub fn send_packets(&mut self, id: u32, packets: &[Packet]) -> Result<(), TunnelError> {
        self.ensure_sendable(id, FlowKind::Ip)?;
        let mut start = 0;
        let mut batch_bytes = 0;
        for (i, packet) in packets.iter().enumerate() {
            if i > start && batch_bytes + packet.data.len() > MAX_PACKET_BATCH {
                self.queue(&Message::packets(id, &packets[start..i]))?;
                start = i;
                batch_bytes = 0;
            }
            batch_bytes += packet.data.len();
        }
        if start < packets.len() {
            self.queue(&Message::packets(id, &packets[start..]))?;
        }
        Ok(())
    }

    /// Close one or both directions of a connection
    ///
    /// Closing an unknown or already closed direction does nothing.
    pub fn close_connection(
        &mut self,
        id: u32,
        direction: CloseDirection,
    ) -> Result<(), TunnelError> {
        self.ensure_running()?;
        let closed = match self.connections.get_mut(&id) {
            Some(connection) => connection.close_local(direction),
            None => None,
        };
        if let Some(closed) = closed {
            debug!("Connection {} closing {:?}", id, closed);
            self.queue(&Message::close(id, closed.peer()))?;
            self.reap(id);
        }
        Ok(())
    }

    /// Tear a connection down and tell the peer to do the same
    pub fn abort_connection(
        &mut self,
        id: u32,
        reason: impl Into<String>,
    ) -> Result<(), TunnelError> {
        let reason = reason.into();
        let Some(mut connection) = self.connections.remove(&id) else {
            return Ok(());
        };
        let notify_peer = !(connection.is_read_closed() && connection.is_write_closed());
        connection.abort();
        debug!("Connection {} aborted: {}", id, reason);
        self.events.push(TunnelEvent::ConnectionAborted { id, reason });

        if notify_peer && !self.closed {
            self.queue(&Message::close(id, CloseDirection::All))?;
        }
        Ok(())
    }

    /// The stream sink of `id` can take more bytes
    pub fn sink_writable(&mut self, id: u32) -> Result<(), TunnelError> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        match connection.flush_saved() {
            Ok(true) if connection.suspend_sent => {
                connection.suspend_sent = false;
                trace!("Connection {} drained, resuming peer", id);
                self.queue(&Message::resume(id))?;
            }
            Ok(_) => {}
            Err(e) => return self.abort_connection(id, e.to_string()),
        }
        self.reap(id);
        Ok(())
    }

    /// Ask the server for its configuration document
    pub fn fetch_configuration(&mut self) -> Result<(), TunnelError> {
        self.ensure_running()?;
        self.queue(&Message::fetch_configuration(None))
    }

    /// Feed bytes read from the transport
    ///
    /// A framing or decoding error is fatal: every connection is aborted and
    /// the engine refuses further work.
    pub fn receive(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        self.ensure_running()?;
        self.decoder.extend(data);
        loop {
            let message = match self.decoder.decode_next() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.fail(e.into())),
            };
            if let Err(e) = self.dispatch(message) {
                return Err(self.fail(e));
            }
        }
    }

    /// Encoded frames waiting for the transport
    pub fn pending_output(&self) -> &[u8] {
        self.output.pending()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// The transport accepted `n` bytes of [`pending_output`](Self::pending_output)
    ///
    /// Sources pause while the transport lags behind (a short write, or more
    /// than [`OUTPUT_HIGH_WATER`] queued) and resume once the whole buffer
    /// has been written.
    pub fn output_written(&mut self, n: usize) {
        self.output.consume(n);
        self.set_output_saturated(!self.output.is_empty());
    }

    pub fn take_events(&mut self) -> Vec<TunnelEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn connection(&self, id: u32) -> Option<&LogicalConnection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reason the tunnel failed, if it did
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Abort every connection and stop the engine
    pub fn shutdown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut ids: Vec<u32> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(mut connection) = self.connections.remove(&id) {
                connection.abort();
                self.events.push(TunnelEvent::ConnectionAborted {
                    id,
                    reason: reason.to_string(),
                });
            }
        }
        self.output.clear();
        debug!("Tunnel shut down: {}", reason);
    }

    fn fail(&mut self, error: TunnelError) -> TunnelError {
        warn!("Tunnel failed: {}", error);
        self.last_error = Some(error.to_string());
        self.shutdown(&error.to_string());
        error
    }

    fn ensure_running(&self) -> Result<(), TunnelError> {
        if self.closed {
            return Err(TunnelError::TunnelClosed);
        }
        Ok(())
    }

    fn ensure_sendable(&self, id: u32, kind: FlowKind) -> Result<(), TunnelError> {
        self.ensure_running()?;
        let connection = self
            .connections
            .get(&id)
            .ok_or(TunnelError::ConnectionNotFound(id))?;
        if connection.kind() != kind {
            return Err(TunnelError::WrongFlowKind {
                id,
                kind: connection.kind(),
            });
        }
        if !connection.is_established() {
            return Err(TunnelError::NotEstablished(id));
        }
        if connection.is_read_closed() {
            return Err(TunnelError::ConnectionClosed(id));
        }
        Ok(())
    }

    fn pending_mut(&mut self, id: u32) -> Result<&mut LogicalConnection, TunnelError> {
        match self.connections.get_mut(&id) {
            Some(connection) if !connection.is_established() => Ok(connection),
            Some(_) => Err(TunnelError::AlreadyEstablished(id)),
            None => Err(TunnelError::ConnectionNotFound(id)),
        }
    }

    fn queue(&mut self, message: &Message) -> Result<(), TunnelError> {
        let frame = message.encode()?;
        trace!(
            "Queue {:?} for connection {} ({} bytes)",
            message.command,
            message.connection_id,
            frame.len()
        );
        self.output.append(&frame);
        if self.output.len() > OUTPUT_HIGH_WATER {
            self.set_output_saturated(true);
        }
        Ok(())
    }

    fn set_output_saturated(&mut self, saturated: bool) {
        if saturated == self.output_saturated {
            return;
        }
        self.output_saturated = saturated;
        trace!("Transport saturated: {}", saturated);
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        for id in ids {
            self.update_pause(id);
        }
    }

    fn reap(&mut self, id: u32) {
        if self.connections.get(&id).is_some_and(LogicalConnection::is_finished) {
            self.connections.remove(&id);
            debug!("Connection {} closed", id);
            self.events.push(TunnelEvent::ConnectionClosed { id });
        }
    }

    fn request_suspend(&mut self, id: u32) -> Result<(), TunnelError> {
        if let Some(connection) = self.connections.get_mut(&id) {
            if !connection.suspend_sent {
                connection.suspend_sent = true;
                trace!("Connection {} sink full, suspending peer", id);
                self.queue(&Message::suspend(id))?;
            }
        }
        Ok(())
    }

    fn update_pause(&mut self, id: u32) {
        let saturated = self.output_saturated;
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if !connection.is_established() || connection.is_read_closed() {
            return;
        }
        let paused = connection.suspended_by_peer || saturated;
        if paused != connection.source_paused {
            connection.source_paused = paused;
            self.events.push(if paused {
                TunnelEvent::PauseSource { id }
            } else {
                TunnelEvent::ResumeSource { id }
            });
        }
    }

    fn dispatch(&mut self, message: Message) -> Result<(), TunnelError> {
        trace!(
            "Received {:?} for connection {}",
            message.command,
            message.connection_id
        );
        match message.command {
            Command::Open => self.handle_open(&message),
            Command::OpenResult => self.handle_open_result(&message),
            Command::Data => self.handle_data(&message),
            Command::Packets => self.handle_packets(&message),
            Command::Close => self.handle_close(&message),
            Command::Suspend => {
                self.set_suspended_by_peer(message.connection_id, true);
                Ok(())
            }
            Command::Resume => {
                self.set_suspended_by_peer(message.connection_id, false);
                Ok(())
            }
            Command::FetchConfiguration => self.handle_fetch_configuration(&message),
        }
    }

    fn handle_open(&mut self, message: &Message) -> Result<(), TunnelError> {
        let id = message.connection_id;
        if matches!(self.role, Role::Client) {
            debug!("Refusing open {} from server", id);
            return self.queue(&Message::open_result(id, OpenResult::Invalid, None));
        }
        if id == TUNNEL_CONNECTION_ID || self.connections.contains_key(&id) {
            warn!("Refusing open for identifier {} already in use", id);
            return self.queue(&Message::open_result(id, OpenResult::Invalid, None));
        }

        let request = match message.open_request() {
            Ok(request) => request,
            Err(e) => {
                debug!("Invalid open {}: {}", id, e);
                return self.queue(&Message::open_result(id, OpenResult::Invalid, None));
            }
        };
        self.connections
            .insert(id, LogicalConnection::new(id, request.kind()));
        self.events.push(TunnelEvent::OpenRequested { id, request });
        Ok(())
    }

    fn handle_open_result(&mut self, message: &Message) -> Result<(), TunnelError> {
        let id = message.connection_id;
        let result = message.result_code()?;
        let Some(connection) = self.connections.get_mut(&id) else {
            trace!("Open result for unknown connection {}", id);
            return Ok(());
        };
        if connection.is_established() {
            debug!("Duplicate open result for connection {}", id);
            return Ok(());
        }

        let configuration = message.configuration().cloned();
        if result != OpenResult::Success {
            self.connections.remove(&id);
            debug!("Connection {} open failed: {:?}", id, result);
            self.events.push(TunnelEvent::OpenCompleted {
                id,
                result,
                configuration,
            });
            return Ok(());
        }

        let delivery = connection.establish();
        self.events.push(TunnelEvent::OpenCompleted {
            id,
            result,
            configuration,
        });
        match delivery {
            Ok(Delivery::Saturated) => self.request_suspend(id)?,
            Ok(_) => {}
            Err(e) => return self.abort_connection(id, e.to_string()),
        }
        self.update_pause(id);
        Ok(())
    }

    fn handle_data(&mut self, message: &Message) -> Result<(), TunnelError> {
        let id = message.connection_id;
        let Some(connection) = self.connections.get_mut(&id) else {
            trace!("Data for unknown connection {}", id);
            return Ok(());
        };

        let outcome = match connection.kind() {
            FlowKind::Tcp => {
                let data = message.payload()?;
                connection.deliver(&data)
            }
            FlowKind::Udp => {
                let datagram = message.datagram_payload()?;
                connection.deliver_datagram(datagram).map(|_| Delivery::Accepted)
            }
            FlowKind::Ip => {
                debug!("Ignoring data on IP connection {}", id);
                return Ok(());
            }
        };

        match outcome {
            Ok(Delivery::Saturated) => self.request_suspend(id),
            Ok(Delivery::Discarded) => {
                trace!("Data after write close on connection {}", id);
                Ok(())
            }
            Ok(Delivery::Accepted) => Ok(()),
            Err(e) => self.abort_connection(id, e.to_string()),
        }
    }

    fn handle_packets(&mut self, message: &Message) -> Result<(), TunnelError> {
        let id = message.connection_id;
        let Some(connection) = self.connections.get_mut(&id) else {
            trace!("Packets for unknown connection {}", id);
            return Ok(());
        };
        if connection.kind() != FlowKind::Ip {
            debug!("Ignoring packets on {:?} connection {}", connection.kind(), id);
            return Ok(());
        }

        let packets = message.packet_list()?;
        if let Err(e) = connection.deliver_packets(packets) {
            return self.abort_connection(id, e.to_string());
        }
        Ok(())
    }

    fn handle_close(&mut self, message: &Message) -> Result<(), TunnelError> {
        let id = message.connection_id;
        let direction = message.close_direction()?;
        let Some(connection) = self.connections.get_mut(&id) else {
            trace!("Close for unknown connection {}", id);
            return Ok(());
        };

        if let Some(closed) = connection.close_remote(direction) {
            debug!("Peer closed {:?} on connection {}", closed, id);
            if closed.includes_read() {
                self.events.push(TunnelEvent::SourceClosed { id });
            }
            self.reap(id);
        }
        Ok(())
    }

    fn set_suspended_by_peer(&mut self, id: u32, suspended: bool) {
        match self.connections.get_mut(&id) {
            Some(connection) => connection.suspended_by_peer = suspended,
            None => {
                trace!("Flow control for unknown connection {}", id);
                return;
            }
        }
        self.update_pause(id);
    }

    fn handle_fetch_configuration(&mut self, message: &Message) -> Result<(), TunnelError> {
        let reply = match (&self.role, message.configuration()) {
            (Role::Server(settings), None) => Some(settings.public_document()),
            (Role::Client, Some(configuration)) => {
                self.events
                    .push(TunnelEvent::ConfigurationReceived(configuration.clone()));
                None
            }
            _ => {
                debug!("Ignoring unexpected configuration message");
                None
            }
        };
        match reply {
            Some(document) => self.queue(&Message::fetch_configuration(Some(document))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketProtocol, Value};
    use crate::tunnel::flow::{PacketSink, StreamSink};
    use std::io;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct TestSink {
        written: Arc<Mutex<Vec<u8>>>,
        room: Arc<Mutex<Option<usize>>>,
    }

    impl TestSink {
        fn limited(room: usize) -> Self {
            let sink = Self::default();
            *sink.room.lock().unwrap() = Some(room);
            sink
        }

        fn unlimit(&self) {
            *self.room.lock().unwrap() = None;
        }

        fn bytes(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    impl StreamSink for TestSink {
        fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
            let mut room = self.room.lock().unwrap();
            let n = match room.as_mut() {
                Some(room) => {
                    let n = data.len().min(*room);
                    *room -= n;
                    n
                }
                None => data.len(),
            };
            self.written.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn close_write(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct CollectPackets(Arc<Mutex<Vec<Packet>>>);

    impl PacketSink for CollectPackets {
        fn write_packets(&mut self, packets: Vec<Packet>) -> io::Result<()> {
            self.0.lock().unwrap().extend(packets);
            Ok(())
        }
    }

    fn settings() -> Arc<ServerSettings> {
        let document = Map::new()
            .with(
                "IPv4",
                Map::new()
                    .with("Netmask", "255.255.255.0")
                    .with(
                        "Pool",
                        Map::new()
                            .with("StartAddress", "10.0.0.2")
                            .with("EndAddress", "10.0.0.9"),
                    ),
            )
            .with("DNS", Map::new().with("Servers", vec![Value::from("10.0.0.1")]));
        Arc::new(ServerSettings::from_document(document).unwrap())
    }

    /// Move everything `from` has queued into `to`
    fn pump(from: &mut TunnelEngine, to: &mut TunnelEngine) {
        let out = from.pending_output().to_vec();
        from.output_written(out.len());
        to.receive(&out).unwrap();
    }

    fn queued_messages(engine: &mut TunnelEngine) -> Vec<Message> {
        let mut decoder = FrameDecoder::new();
        decoder.extend(engine.pending_output());
        let n = engine.pending_output().len();
        engine.output_written(n);
        std::iter::from_fn(|| decoder.decode_next().unwrap()).collect()
    }

    fn tcp_request() -> OpenRequest {
        OpenRequest::Tcp {
            host: "127.0.0.1".to_string(),
            port: 80,
        }
    }

    /// Open TCP connection `id` from client to server with the given sinks
    fn open_tcp(
        client: &mut TunnelEngine,
        server: &mut TunnelEngine,
        id: u32,
        client_sink: TestSink,
        server_sink: TestSink,
    ) {
        client
            .open_connection(id, tcp_request(), FlowSink::Stream(Box::new(client_sink)))
            .unwrap();
        pump(client, server);
        assert_eq!(
            server.take_events(),
            vec![TunnelEvent::OpenRequested {
                id,
                request: tcp_request()
            }]
        );
        server
            .accept_open(id, FlowSink::Stream(Box::new(server_sink)), None)
            .unwrap();
        pump(server, client);
        assert!(matches!(
            client.take_events()[..],
            [TunnelEvent::OpenCompleted {
                result: OpenResult::Success,
                ..
            }]
        ));
    }

    #[test]
    fn test_multiplexing_isolation() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        let (a, b) = (TestSink::default(), TestSink::default());
        open_tcp(&mut client, &mut server, 1, TestSink::default(), a.clone());
        open_tcp(&mut client, &mut server, 2, TestSink::default(), b.clone());

        client.send_data(1, Bytes::from_static(b"a1")).unwrap();
        client.send_data(2, Bytes::from_static(b"b1")).unwrap();
        client.send_data(2, Bytes::from_static(b"b2")).unwrap();
        client.send_data(1, Bytes::from_static(b"a2")).unwrap();
        pump(&mut client, &mut server);

        assert_eq!(a.bytes(), b"a1a2");
        assert_eq!(b.bytes(), b"b1b2");
    }

    #[test]
    fn test_suspend_resume_without_loss() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        let sink = TestSink::limited(4);
        open_tcp(&mut client, &mut server, 7, TestSink::default(), sink.clone());

        client.send_data(7, Bytes::from_static(b"0123456789")).unwrap();
        client.send_data(7, Bytes::from_static(b"abcdef")).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(sink.bytes(), b"0123");

        let sent = queued_messages(&mut server);
        let suspends = sent.iter().filter(|m| m.command == Command::Suspend).count();
        assert_eq!(suspends, 1);

        // Feed the suspend to the client so its source pauses
        let frame = Message::suspend(7).encode().unwrap();
        client.receive(&frame).unwrap();
        assert_eq!(client.take_events(), vec![TunnelEvent::PauseSource { id: 7 }]);

        sink.unlimit();
        server.sink_writable(7).unwrap();
        assert_eq!(sink.bytes(), b"0123456789abcdef");
        let sent = queued_messages(&mut server);
        assert_eq!(sent, vec![Message::resume(7)]);

        // A second writable notification must not resume twice
        server.sink_writable(7).unwrap();
        assert!(!server.has_pending_output());

        client.receive(&Message::resume(7).encode().unwrap()).unwrap();
        assert_eq!(client.take_events(), vec![TunnelEvent::ResumeSource { id: 7 }]);
    }

    #[test]
    fn test_idempotent_close() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        open_tcp(&mut client, &mut server, 3, TestSink::default(), TestSink::default());

        client.close_connection(3, CloseDirection::All).unwrap();
        assert_eq!(queued_messages(&mut client), vec![Message::close(3, CloseDirection::All)]);
        assert_eq!(client.take_events(), vec![TunnelEvent::ConnectionClosed { id: 3 }]);

        client.close_connection(3, CloseDirection::All).unwrap();
        assert!(!client.has_pending_output());
        assert!(client.take_events().is_empty());

        let close = Message::close(3, CloseDirection::All).encode().unwrap();
        server.receive(&close).unwrap();
        server.receive(&close).unwrap();
        assert_eq!(
            server.take_events(),
            vec![
                TunnelEvent::SourceClosed { id: 3 },
                TunnelEvent::ConnectionClosed { id: 3 }
            ]
        );
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_half_close_removes_after_both_directions() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        open_tcp(&mut client, &mut server, 4, TestSink::default(), TestSink::default());

        // Client source hit EOF
        client.close_connection(4, CloseDirection::Read).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(client.connection_count(), 1);
        assert!(server.connection(4).unwrap().is_write_closed());
        client.send_data(4, Bytes::from_static(b"x")).unwrap_err();

        // Server still answers, then its source ends too
        server.send_data(4, Bytes::from_static(b"reply")).unwrap();
        server.close_connection(4, CloseDirection::Read).unwrap();
        pump(&mut server, &mut client);

        assert_eq!(client.connection_count(), 0);
        assert_eq!(server.connection_count(), 0);
        assert!(client
            .take_events()
            .contains(&TunnelEvent::ConnectionClosed { id: 4 }));
    }

    #[test]
    fn test_duplicate_open_is_invalid() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        open_tcp(&mut client, &mut server, 9, TestSink::default(), TestSink::default());

        let frame = Message::open(9, &OpenRequest::Udp).encode().unwrap();
        server.receive(&frame).unwrap();
        assert!(server.take_events().is_empty());
        assert_eq!(
            queued_messages(&mut server),
            vec![Message::open_result(9, OpenResult::Invalid, None)]
        );
        assert_eq!(server.connection(9).unwrap().kind(), FlowKind::Tcp);
    }

    #[test]
    fn test_client_refuses_open() {
        let mut client = TunnelEngine::client();
        let frame = Message::open(5, &OpenRequest::Ip).encode().unwrap();
        client.receive(&frame).unwrap();
        assert_eq!(
            queued_messages(&mut client),
            vec![Message::open_result(5, OpenResult::Invalid, None)]
        );
        assert_eq!(client.connection_count(), 0);
    }

    #[test]
    fn test_unknown_identifier_ignored() {
        let mut server = TunnelEngine::server(settings());
        let frame = Message::data(77, Bytes::from_static(b"late")).encode().unwrap();
        server.receive(&frame).unwrap();
        assert!(server.take_events().is_empty());
        assert!(!server.has_pending_output());
    }

    #[test]
    fn test_oversize_frame_is_fatal() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        open_tcp(&mut client, &mut server, 1, TestSink::default(), TestSink::default());

        let bogus = ((crate::protocol::MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        let err = server.receive(&bogus).unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
        assert!(server.is_closed());
        assert!(server.last_error().is_some());
        assert_eq!(server.connection_count(), 0);
        assert!(matches!(
            server.take_events()[..],
            [TunnelEvent::ConnectionAborted { id: 1, .. }]
        ));
        assert!(matches!(
            server.receive(&[]),
            Err(TunnelError::TunnelClosed)
        ));
    }

    #[test]
    fn test_missing_field_is_fatal() {
        let mut server = TunnelEngine::server(settings());
        let frame = Message::new(Command::Close, 1).encode().unwrap();
        assert!(server.receive(&frame).is_err());
        assert!(server.is_closed());
    }

    #[test]
    fn test_fetch_configuration_omits_ipv4() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());

        client.fetch_configuration().unwrap();
        pump(&mut client, &mut server);
        pump(&mut server, &mut client);

        let events = client.take_events();
        let [TunnelEvent::ConfigurationReceived(configuration)] = &events[..] else {
            panic!("unexpected events: {:?}", events);
        };
        assert!(!configuration.contains_key("IPv4"));
        assert!(configuration.contains_key("DNS"));
    }

    #[test]
    fn test_ip_packets_reach_sink() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        let received = CollectPackets::default();

        let client_sink = FlowSink::Packets(Box::new(CollectPackets::default()));
        client.open_connection(1, OpenRequest::Ip, client_sink).unwrap();
        pump(&mut client, &mut server);
        server.take_events();
        server
            .accept_open(1, FlowSink::Packets(Box::new(received.clone())), None)
            .unwrap();
        pump(&mut server, &mut client);

        let packet = Packet::new(vec![0x45, 0x00, 0x00, 0x14], PacketProtocol::Ipv4);
        client.send_packets(1, &[packet.clone()]).unwrap();
        pump(&mut client, &mut server);

        assert_eq!(*received.0.lock().unwrap(), vec![packet]);
    }

    #[test]
    fn test_transport_saturation_pauses_sources() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        open_tcp(&mut client, &mut server, 1, TestSink::default(), TestSink::default());

        client.send_data(1, Bytes::from_static(b"0123456789")).unwrap();
        client.output_written(3);
        assert_eq!(client.take_events(), vec![TunnelEvent::PauseSource { id: 1 }]);

        // Still accepted while saturated, in order
        client.send_data(1, Bytes::from_static(b"more")).unwrap();
        let rest = client.pending_output().len();
        client.output_written(rest);
        assert_eq!(client.take_events(), vec![TunnelEvent::ResumeSource { id: 1 }]);
    }

    #[test]
    fn test_output_high_water_pauses_sources() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        open_tcp(&mut client, &mut server, 1, TestSink::default(), TestSink::default());
        open_tcp(&mut client, &mut server, 2, TestSink::default(), TestSink::default());

        // Nothing written yet, so no short write ever happens
        let chunk = Bytes::from(vec![0u8; MAX_DATA_CHUNK]);
        while client.pending_output().len() <= OUTPUT_HIGH_WATER {
            client.send_data(1, chunk.clone()).unwrap();
        }
        let mut events = client.take_events();
        events.sort_by_key(|e| match e {
            TunnelEvent::PauseSource { id } => *id,
            _ => u32::MAX,
        });
        assert_eq!(
            events,
            vec![
                TunnelEvent::PauseSource { id: 1 },
                TunnelEvent::PauseSource { id: 2 }
            ]
        );

        let queued = client.pending_output().len();
        client.output_written(queued);
        assert_eq!(client.take_events().len(), 2);
        assert!(!client.connection(1).unwrap().source_paused);
    }

    #[test]
    fn test_open_failure_removes_connection() {
        let mut client = TunnelEngine::client();
        let mut server = TunnelEngine::server(settings());
        client
            .open_connection(2, tcp_request(), FlowSink::Stream(Box::new(TestSink::default())))
            .unwrap();
        pump(&mut client, &mut server);
        server.take_events();
        server.reject_open(2, OpenResult::Timeout).unwrap();
        pump(&mut server, &mut client);

        assert_eq!(
            client.take_events(),
            vec![TunnelEvent::OpenCompleted {
                id: 2,
                result: OpenResult::Timeout,
                configuration: None
            }]
        );
        assert_eq!(client.connection_count(), 0);
        assert_eq!(server.connection_count(), 0);
    }
}
