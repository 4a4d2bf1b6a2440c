//! Task plumbing shared by the client and server drivers

use super::flow::PacketSource;
use super::{TunnelEngine, TunnelError, READ_CHUNK_SIZE};
use crate::protocol::{CloseDirection, Datagram, Packet};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Largest UDP payload read in one call
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Message from the reader task
pub(crate) enum ReaderMessage {
    /// Bytes read from the transport
    Data(Bytes),
    /// Reader encountered an error
    Error(io::Error),
    /// Transport closed by the peer
    Closed,
}

/// Something a local source produced for connection `id`
pub(crate) enum SourceEvent {
    Data(Bytes),
    Datagram(Datagram),
    Packets(Vec<Packet>),
    Eof,
    Failed(String),
}

/// Aborts the task when dropped
pub(crate) struct AbortOnDrop(Option<JoinHandle<()>>);

impl AbortOnDrop {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self(Some(handle))
    }

    /// Let the task run to completion on its own
    pub(crate) fn detach(mut self) {
        self.0.take();
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Spawn a dedicated transport reader
///
/// Reads happen on their own task so `select!` in the drivers never drops a
/// read halfway.
pub(crate) fn spawn_reader<R>(mut reader: R) -> (mpsc::Receiver<ReaderMessage>, AbortOnDrop)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let message = match reader.read(&mut buf).await {
                Ok(0) => ReaderMessage::Closed,
                Ok(n) => ReaderMessage::Data(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => ReaderMessage::Error(e),
            };
            let more = matches!(message, ReaderMessage::Data(_));
            if tx.send(message).await.is_err() || !more {
                break;
            }
        }
    });
    (rx, AbortOnDrop::new(task))
}

/// Write what the transport takes of the engine's pending output
///
/// Cancel-safe: nothing is consumed unless the write completed.
pub(crate) async fn write_pending<W>(writer: &mut W, engine: &mut TunnelEngine) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let n = writer.write(engine.pending_output()).await?;
    if n == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    engine.output_written(n);
    if !engine.has_pending_output() {
        writer.flush().await?;
    }
    Ok(())
}

/// Write all pending output
pub(crate) async fn flush_pending<W>(writer: &mut W, engine: &mut TunnelEngine) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while engine.has_pending_output() {
        write_pending(writer, engine).await?;
    }
    Ok(())
}

/// Hand a source event to the engine
pub(crate) fn forward_source_event(
    engine: &mut TunnelEngine,
    id: u32,
    event: SourceEvent,
) -> Result<(), TunnelError> {
    match event {
        SourceEvent::Data(data) => engine.send_data(id, data),
        SourceEvent::Datagram(datagram) => engine.send_datagram(id, &datagram),
        SourceEvent::Packets(packets) => engine.send_packets(id, &packets),
        SourceEvent::Eof => engine.close_connection(id, CloseDirection::Read),
        SourceEvent::Failed(reason) => engine.abort_connection(id, reason),
    }
}

/// Lets a source task wait while its connection is paused
pub(crate) struct PauseGate(watch::Receiver<bool>);

impl PauseGate {
    /// Wait until reading may continue; false once the pump is dropped
    pub(crate) async fn wait(&mut self) -> bool {
        self.0.wait_for(|paused| !*paused).await.is_ok()
    }
}

/// A spawned source task and its pause switch
pub(crate) struct SourcePump {
    paused: watch::Sender<bool>,
    _task: AbortOnDrop,
}

impl SourcePump {
    pub(crate) fn spawn<F, Fut>(pump: F) -> Self
    where
        F: FnOnce(PauseGate) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (paused, rx) = watch::channel(false);
        let task = tokio::spawn(pump(PauseGate(rx)));
        Self {
            paused,
            _task: AbortOnDrop::new(task),
        }
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }
}

/// Pump bytes from a proxied stream
pub(crate) async fn pump_stream<R>(
    id: u32,
    mut reader: R,
    mut gate: PauseGate,
    events: mpsc::Sender<(u32, SourceEvent)>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    while gate.wait().await {
        let event = match reader.read(&mut buf).await {
            Ok(0) => SourceEvent::Eof,
            Ok(n) => SourceEvent::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => SourceEvent::Failed(e.to_string()),
        };
        if !send_source_event(&events, id, event).await {
            break;
        }
    }
}

/// Pump datagrams arriving on a proxied UDP socket
pub(crate) async fn pump_datagrams(
    id: u32,
    socket: Arc<UdpSocket>,
    mut gate: PauseGate,
    events: mpsc::Sender<(u32, SourceEvent)>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while gate.wait().await {
        let event = match socket.recv_from(&mut buf).await {
            Ok((n, from)) => SourceEvent::Datagram(Datagram {
                data: Bytes::copy_from_slice(&buf[..n]),
                host: from.ip().to_string(),
                port: from.port(),
            }),
            Err(e) => SourceEvent::Failed(e.to_string()),
        };
        if !send_source_event(&events, id, event).await {
            break;
        }
    }
}

/// Pump captured IP packets
pub(crate) async fn pump_packets(
    id: u32,
    mut source: Box<dyn PacketSource>,
    mut gate: PauseGate,
    events: mpsc::Sender<(u32, SourceEvent)>,
) {
    while gate.wait().await {
        let event = match source.read_packets().await {
            Ok(packets) if packets.is_empty() => SourceEvent::Eof,
            Ok(packets) => SourceEvent::Packets(packets),
            Err(e) => SourceEvent::Failed(e.to_string()),
        };
        if !send_source_event(&events, id, event).await {
            break;
        }
    }
}

/// Returns false when the pump should stop
async fn send_source_event(
    events: &mpsc::Sender<(u32, SourceEvent)>,
    id: u32,
    event: SourceEvent,
) -> bool {
    let last = matches!(event, SourceEvent::Eof | SourceEvent::Failed(_));
    events.send((id, event)).await.is_ok() && !last
}
