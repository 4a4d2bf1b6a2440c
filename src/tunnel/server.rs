//! Server driver: accepts opens and fans them out to real sockets
//!
//! One `ServerTunnel::run` call serves one client. TCP and UDP opens go
//! through a [`ProxyConnector`]; IP flows are handed to a [`PacketGateway`]
//! with an address from the server's pool.

use super::driver::{
    flush_pending, forward_source_event, pump_datagrams, pump_packets, pump_stream, spawn_reader,
    write_pending, AbortOnDrop, ReaderMessage, SourceEvent, SourcePump,
};
use super::flow::{DatagramSink, FlowSink, PacketSink, PacketSource, StreamSink};
use super::{TunnelEngine, TunnelError, TunnelEvent};
use crate::protocol::{Datagram, Map, OpenRequest, OpenResult};
use crate::settings::ServerSettings;
use crate::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Default time allowed for an outbound proxy connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunks queued for a proxied socket before its sink reports full
const SINK_QUEUE: usize = 16;

/// Largest chunk taken by a stream sink per write
const SINK_CHUNK: usize = 64 * 1024;

/// Datagrams queued for a proxied UDP socket; more are dropped
const DATAGRAM_QUEUE: usize = 256;

/// Time allowed to flush a final close to the client
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte stream to a proxy target
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Opens the real sockets behind TCP and UDP flows
#[async_trait]
pub trait ProxyConnector: Send + Sync {
    async fn connect_tcp(&self, host: &str, port: u16) -> io::Result<BoxedStream>;

    async fn bind_udp(&self) -> io::Result<UdpSocket>;
}

/// Connects straight to the requested destination
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectConnector;

#[async_trait]
impl ProxyConnector for DirectConnector {
    async fn connect_tcp(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn bind_udp(&self) -> io::Result<UdpSocket> {
        UdpSocket::bind(("0.0.0.0", 0)).await
    }
}

/// Packet endpoints for one IP flow
pub struct IpFlow {
    pub sink: Box<dyn PacketSink>,
    pub source: Box<dyn PacketSource>,
}

/// Bridges IP flows into the host network stack
#[async_trait]
pub trait PacketGateway: Send + Sync {
    /// Start routing packets for `address` through connection `id`
    async fn attach(&self, id: u32, address: Ipv4Addr) -> io::Result<IpFlow>;

    /// The connection is gone
    fn detach(&self, _id: u32) {}
}

/// Server side of the tunnel
pub struct ServerTunnel {
    settings: Arc<ServerSettings>,
    connector: Arc<dyn ProxyConnector>,
    gateway: Option<Arc<dyn PacketGateway>>,
    connect_timeout: Duration,
}

impl ServerTunnel {
    pub fn new(settings: Arc<ServerSettings>) -> Self {
        Self {
            settings,
            connector: Arc::new(DirectConnector),
            gateway: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn ProxyConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Without a gateway every IP flow is refused
    pub fn with_gateway(mut self, gateway: Arc<dyn PacketGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Serve one client until it disconnects, the tunnel fails, or
    /// `shutdown` resolves
    pub async fn run<S, F>(&self, stream: S, shutdown: F) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (mut reader_rx, _reader) = spawn_reader(read_half);
        let (proxy_tx, mut proxy_rx) = mpsc::channel::<ProxyEvent>(256);
        let (source_tx, mut source_rx) = mpsc::channel::<(u32, SourceEvent)>(256);

        let mut session = Session {
            tunnel: self,
            engine: TunnelEngine::server(self.settings.clone()),
            flows: HashMap::new(),
            proxy_tx,
            source_tx,
        };
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                msg = reader_rx.recv() => match msg {
                    Some(ReaderMessage::Data(data)) => {
                        if let Err(e) = session.engine.receive(&data) {
                            break Err(e.into());
                        }
                    }
                    Some(ReaderMessage::Error(e)) => break Err(Error::Io(e)),
                    Some(ReaderMessage::Closed) | None => {
                        debug!("Client disconnected");
                        break Ok(());
                    }
                },
                Some(event) = proxy_rx.recv() => session.handle_proxy_event(event),
                Some((id, event)) = source_rx.recv() => {
                    log_dropped(id, forward_source_event(&mut session.engine, id, event));
                }
                res = write_pending(&mut write_half, &mut session.engine),
                    if session.engine.has_pending_output() =>
                {
                    if let Err(e) = res {
                        break Err(Error::Io(e));
                    }
                }
                _ = &mut shutdown => {
                    info!("Server shutting down tunnel");
                    break Ok(());
                }
            }
            session.handle_engine_events();
        };

        if result.is_ok() && !session.engine.is_closed() {
            let _ = tokio::time::timeout(
                FLUSH_TIMEOUT,
                flush_pending(&mut write_half, &mut session.engine),
            )
            .await;
        }
        session.engine.shutdown("tunnel closed");
        session.handle_engine_events();
        let _ = write_half.shutdown().await;
        result
    }
}

/// Completion of work spawned for one connection
enum ProxyEvent {
    TcpConnected {
        id: u32,
        target: String,
        stream: BoxedStream,
    },
    UdpBound {
        id: u32,
        socket: UdpSocket,
    },
    IpAttached {
        id: u32,
        flow: IpFlow,
    },
    OpenFailed {
        id: u32,
        result: OpenResult,
        reason: String,
    },
    SinkWritable {
        id: u32,
    },
    SinkFailed {
        id: u32,
        reason: String,
    },
}

/// Local resources of one connection
#[derive(Default)]
struct Flow {
    opener: Option<AbortOnDrop>,
    source: Option<SourcePump>,
    address: Option<Ipv4Addr>,
}

struct Session<'a> {
    tunnel: &'a ServerTunnel,
    engine: TunnelEngine,
    flows: HashMap<u32, Flow>,
    proxy_tx: mpsc::Sender<ProxyEvent>,
    source_tx: mpsc::Sender<(u32, SourceEvent)>,
}

impl Session<'_> {
    fn handle_engine_events(&mut self) {
        for event in self.engine.take_events() {
            match event {
                TunnelEvent::OpenRequested { id, request } => self.start_open(id, request),
                TunnelEvent::PauseSource { id } => self.set_paused(id, true),
                TunnelEvent::ResumeSource { id } => self.set_paused(id, false),
                TunnelEvent::SourceClosed { id } => {
                    if let Some(flow) = self.flows.get_mut(&id) {
                        flow.source = None;
                    }
                }
                TunnelEvent::ConnectionClosed { id } => self.remove_flow(id),
                TunnelEvent::ConnectionAborted { id, reason } => {
                    debug!("Connection {} aborted: {}", id, reason);
                    self.remove_flow(id);
                }
                TunnelEvent::OpenCompleted { .. } | TunnelEvent::ConfigurationReceived(_) => {}
            }
        }
    }

    fn start_open(&mut self, id: u32, request: OpenRequest) {
        let events = self.proxy_tx.clone();
        let mut flow = Flow::default();

        let task = match request {
            OpenRequest::Tcp { host, port } => {
                let connector = self.tunnel.connector.clone();
                let timeout = self.tunnel.connect_timeout;
                tokio::spawn(async move {
                    let target = format!("{}:{}", host, port);
                    let connect = connector.connect_tcp(&host, port);
                    let event = match tokio::time::timeout(timeout, connect).await {
                        Ok(Ok(stream)) => ProxyEvent::TcpConnected { id, target, stream },
                        Ok(Err(e)) => ProxyEvent::OpenFailed {
                            id,
                            result: OpenResult::Failure,
                            reason: format!("connect to {} failed: {}", target, e),
                        },
                        Err(_) => ProxyEvent::OpenFailed {
                            id,
                            result: OpenResult::Timeout,
                            reason: format!("connect to {} timed out", target),
                        },
                    };
                    let _ = events.send(event).await;
                })
            }
            OpenRequest::Udp => {
                let connector = self.tunnel.connector.clone();
                tokio::spawn(async move {
                    let event = match connector.bind_udp().await {
                        Ok(socket) => ProxyEvent::UdpBound { id, socket },
                        Err(e) => ProxyEvent::OpenFailed {
                            id,
                            result: OpenResult::Failure,
                            reason: format!("UDP bind failed: {}", e),
                        },
                    };
                    let _ = events.send(event).await;
                })
            }
            OpenRequest::Ip => {
                let Some(gateway) = self.tunnel.gateway.clone() else {
                    warn!("No packet gateway configured, refusing IP flow {}", id);
                    self.reject(id, OpenResult::Failure);
                    return;
                };
                let Some(address) = self.tunnel.settings.pool().and_then(|pool| pool.allocate())
                else {
                    warn!("Address pool exhausted, refusing IP flow {}", id);
                    self.reject(id, OpenResult::Failure);
                    return;
                };
                flow.address = Some(address);
                tokio::spawn(async move {
                    let event = match gateway.attach(id, address).await {
                        Ok(flow) => ProxyEvent::IpAttached { id, flow },
                        Err(e) => ProxyEvent::OpenFailed {
                            id,
                            result: OpenResult::Failure,
                            reason: format!("packet gateway refused {}: {}", address, e),
                        },
                    };
                    let _ = events.send(event).await;
                })
            }
        };

        flow.opener = Some(AbortOnDrop::new(task));
        self.flows.insert(id, flow);
    }

    fn handle_proxy_event(&mut self, event: ProxyEvent) {
        match event {
            ProxyEvent::TcpConnected { id, target, stream } => {
                let (reader, writer) = tokio::io::split(stream);
                let sink = ChannelSink::spawn(id, writer, self.proxy_tx.clone());
                if self.accept(id, FlowSink::Stream(Box::new(sink)), None) {
                    info!("Connection {} connected to {}", id, target);
                    let events = self.source_tx.clone();
                    self.start_source(id, SourcePump::spawn(move |gate| {
                        pump_stream(id, reader, gate, events)
                    }));
                }
            }
            ProxyEvent::UdpBound { id, socket } => {
                let socket = Arc::new(socket);
                let sink = DatagramQueue::spawn(id, socket.clone());
                if self.accept(id, FlowSink::Datagrams(Box::new(sink)), None) {
                    debug!("Connection {} bound UDP socket", id);
                    let events = self.source_tx.clone();
                    self.start_source(id, SourcePump::spawn(move |gate| {
                        pump_datagrams(id, socket, gate, events)
                    }));
                }
            }
            ProxyEvent::IpAttached { id, flow } => {
                let Some(address) = self.flows.get(&id).and_then(|f| f.address) else {
                    return;
                };
                let configuration = self.tunnel.settings.client_configuration(address);
                if self.accept(id, FlowSink::Packets(flow.sink), Some(configuration)) {
                    info!("Connection {} assigned {}", id, address);
                    let events = self.source_tx.clone();
                    let source = flow.source;
                    self.start_source(id, SourcePump::spawn(move |gate| {
                        pump_packets(id, source, gate, events)
                    }));
                }
            }
            ProxyEvent::OpenFailed { id, result, reason } => {
                info!("Connection {} open failed: {}", id, reason);
                self.reject(id, result);
            }
            ProxyEvent::SinkWritable { id } => {
                log_dropped(id, self.engine.sink_writable(id));
            }
            ProxyEvent::SinkFailed { id, reason } => {
                log_dropped(id, self.engine.abort_connection(id, reason));
            }
        }
    }

    /// Returns false when the connection vanished in the meantime
    fn accept(&mut self, id: u32, sink: FlowSink, configuration: Option<Map>) -> bool {
        if !self.flows.contains_key(&id) {
            trace!("Open completed for forgotten connection {}", id);
            return false;
        }
        match self.engine.accept_open(id, sink, configuration) {
            Ok(()) => true,
            Err(e) => {
                debug!("Connection {} could not be accepted: {}", id, e);
                self.remove_flow(id);
                false
            }
        }
    }

    fn reject(&mut self, id: u32, result: OpenResult) {
        log_dropped(id, self.engine.reject_open(id, result));
        self.remove_flow(id);
    }

    fn start_source(&mut self, id: u32, pump: SourcePump) {
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.opener = None;
            flow.source = Some(pump);
        }
    }

    fn set_paused(&mut self, id: u32, paused: bool) {
        if let Some(source) = self.flows.get(&id).and_then(|f| f.source.as_ref()) {
            trace!("Connection {} source paused: {}", id, paused);
            source.set_paused(paused);
        }
    }

    fn remove_flow(&mut self, id: u32) {
        let Some(flow) = self.flows.remove(&id) else {
            return;
        };
        if let Some(address) = flow.address {
            if let Some(pool) = self.tunnel.settings.pool() {
                pool.release(address);
            }
            if let Some(gateway) = &self.tunnel.gateway {
                gateway.detach(id);
            }
        }
    }
}

fn log_dropped(id: u32, result: Result<(), TunnelError>) {
    if let Err(e) = result {
        trace!("Connection {}: {}", id, e);
    }
}

/// Stream sink backed by a writer task
///
/// The queue is bounded; when it is full `try_write` reports `WouldBlock`
/// and the writer task sends `SinkWritable` after its next write.
///
/// Dropping the sink without `close_write` aborts the writer and discards
/// whatever is still queued. After `close_write` the writer drains the queue
/// and shuts the target down on its own.
struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
    saturated: Arc<AtomicBool>,
    writer: Option<AbortOnDrop>,
}

impl ChannelSink {
    fn spawn<W>(id: u32, mut writer: W, events: mpsc::Sender<ProxyEvent>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(SINK_QUEUE);
        let saturated = Arc::new(AtomicBool::new(false));
        let flag = saturated.clone();

        let task = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    let _ = events
                        .send(ProxyEvent::SinkFailed {
                            id,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
                if flag.swap(false, Ordering::SeqCst)
                    && events.send(ProxyEvent::SinkWritable { id }).await.is_err()
                {
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            tx: Some(tx),
            saturated,
            writer: Some(AbortOnDrop::new(task)),
        }
    }
}

impl StreamSink for ChannelSink {
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        let n = data.len().min(SINK_CHUNK);
        let chunk = Bytes::copy_from_slice(&data[..n]);

        let chunk = match tx.try_send(chunk) {
            Ok(()) => return Ok(n),
            Err(TrySendError::Full(chunk)) => chunk,
            Err(TrySendError::Closed(_)) => return Err(io::ErrorKind::BrokenPipe.into()),
        };
        // Set the flag before retrying so a drain in between is not missed
        self.saturated.store(true, Ordering::SeqCst);
        match tx.try_send(chunk) {
            Ok(()) => Ok(n),
            Err(TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn close_write(&mut self) {
        self.tx = None;
        if let Some(writer) = self.writer.take() {
            writer.detach();
        }
    }
}

/// Datagram sink backed by a sender task
///
/// Queued datagrams are dropped with the sink.
struct DatagramQueue {
    tx: mpsc::Sender<Datagram>,
    _sender: AbortOnDrop,
}

impl DatagramQueue {
    fn spawn(id: u32, socket: Arc<UdpSocket>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Datagram>(DATAGRAM_QUEUE);
        let task = tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                let target = (datagram.host.as_str(), datagram.port);
                if let Err(e) = socket.send_to(&datagram.data, target).await {
                    debug!(
                        "Connection {} dropped datagram to {}:{}: {}",
                        id, datagram.host, datagram.port, e
                    );
                }
            }
        });
        Self {
            tx,
            _sender: AbortOnDrop::new(task),
        }
    }
}

impl DatagramSink for DatagramQueue {
    fn send_datagram(&mut self, datagram: Datagram) -> io::Result<()> {
        match self.tx.try_send(datagram) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(datagram)) => {
                trace!("Datagram queue full, dropping {} bytes", datagram.data.len());
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}
