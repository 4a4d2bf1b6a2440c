//! Client driver: one IP flow plus configuration negotiation

use super::driver::{
    flush_pending, forward_source_event, pump_packets, spawn_reader, write_pending,
    ReaderMessage, SourceEvent, SourcePump,
};
use super::flow::{FlowSink, PacketSink, PacketSource};
use super::{TunnelEngine, TunnelEvent};
use crate::protocol::{CloseDirection, Map, OpenRequest, OpenResult};
use crate::settings::NetworkSettings;
use crate::transport::{Endpoint, Transport};
use crate::Error;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Time allowed to flush a final close to the server
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Applies tunnel network settings to the local system
#[async_trait]
pub trait SettingsApplier: Send {
    async fn apply(&mut self, settings: &NetworkSettings) -> io::Result<()>;
}

/// Progress reported while the client runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Settings applied; packets are flowing
    Established(NetworkSettings),
    /// Reply to a configuration fetch
    Configuration(Map),
}

/// Client side of the tunnel
pub struct ClientTunnel {
    remote_host: String,
    source: Box<dyn PacketSource>,
    sink: Box<dyn PacketSink>,
    applier: Box<dyn SettingsApplier>,
    fetch_configuration: bool,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl ClientTunnel {
    /// `remote_host` is reported as the tunnel's remote address
    pub fn new(
        remote_host: impl Into<String>,
        source: Box<dyn PacketSource>,
        sink: Box<dyn PacketSink>,
        applier: Box<dyn SettingsApplier>,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            source,
            sink,
            applier,
            fetch_configuration: false,
            events: None,
        }
    }

    /// Also ask for the server's configuration document
    pub fn fetch_configuration(mut self, enabled: bool) -> Self {
        self.fetch_configuration = enabled;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Connect through `transport` and run until the tunnel ends
    pub async fn connect<T, F>(
        self,
        transport: &T,
        endpoint: &Endpoint,
        shutdown: F,
    ) -> Result<(), Error>
    where
        T: Transport,
        F: Future<Output = ()> + Send,
    {
        info!("Connecting to {}", endpoint);
        let stream = transport.connect(endpoint).await?;
        debug!("Transport connected");
        self.run(stream, shutdown).await
    }

    /// Run the tunnel over an established stream
    ///
    /// Returns `Ok` when the flow closes gracefully or `shutdown` resolves.
    pub async fn run<S, F>(self, stream: S, shutdown: F) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let ClientTunnel {
            remote_host,
            source,
            sink,
            mut applier,
            fetch_configuration,
            events,
        } = self;

        let (read_half, mut write_half) = tokio::io::split(stream);
        let (mut reader_rx, _reader) = spawn_reader(read_half);
        let (source_tx, mut source_rx) = mpsc::channel::<(u32, SourceEvent)>(64);

        let mut engine = TunnelEngine::client();
        let id = rand::thread_rng().gen_range(1..=u32::MAX);
        engine.open_connection(id, OpenRequest::Ip, FlowSink::Packets(sink))?;
        if fetch_configuration {
            engine.fetch_configuration()?;
        }

        let mut source = Some(source);
        let mut pump: Option<SourcePump> = None;
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                msg = reader_rx.recv() => match msg {
                    Some(ReaderMessage::Data(data)) => {
                        if let Err(e) = engine.receive(&data) {
                            break Err(e.into());
                        }
                    }
                    Some(ReaderMessage::Error(e)) => break Err(Error::Io(e)),
                    Some(ReaderMessage::Closed) | None => break Err(Error::ConnectionClosed),
                },
                Some((flow, event)) = source_rx.recv() => {
                    if let Err(e) = forward_source_event(&mut engine, flow, event) {
                        debug!("Dropped local packets: {}", e);
                    }
                }
                res = write_pending(&mut write_half, &mut engine),
                    if engine.has_pending_output() =>
                {
                    if let Err(e) = res {
                        break Err(Error::Io(e));
                    }
                }
                _ = &mut shutdown => {
                    info!("Client shutting down");
                    let _ = engine.close_connection(id, CloseDirection::All);
                    break Ok(());
                }
            }

            let mut outcome = None;
            for event in engine.take_events() {
                match event {
                    TunnelEvent::OpenCompleted {
                        result,
                        configuration,
                        ..
                    } => {
                        if result != OpenResult::Success {
                            outcome = Some(Err(open_error(result)));
                            continue;
                        }
                        let settings = match NetworkSettings::from_configuration(
                            &configuration.unwrap_or_default(),
                            &remote_host,
                        ) {
                            Ok(settings) => settings,
                            Err(e) => {
                                outcome = Some(Err(Error::Internal(e.to_string())));
                                continue;
                            }
                        };
                        if let Err(e) = applier.apply(&settings).await {
                            outcome = Some(Err(Error::BadConfiguration(format!(
                                "failed to apply network settings: {}",
                                e
                            ))));
                            continue;
                        }

                        info!(
                            "Tunnel established: address {} netmask {}",
                            settings.address, settings.netmask
                        );
                        if let Some(source) = source.take() {
                            let events = source_tx.clone();
                            pump = Some(SourcePump::spawn(move |gate| {
                                pump_packets(id, source, gate, events)
                            }));
                        }
                        notify(&events, ClientEvent::Established(settings));
                    }
                    TunnelEvent::ConfigurationReceived(configuration) => {
                        notify(&events, ClientEvent::Configuration(configuration));
                    }
                    TunnelEvent::PauseSource { .. } => {
                        if let Some(pump) = &pump {
                            pump.set_paused(true);
                        }
                    }
                    TunnelEvent::ResumeSource { .. } => {
                        if let Some(pump) = &pump {
                            pump.set_paused(false);
                        }
                    }
                    TunnelEvent::SourceClosed { .. } => pump = None,
                    TunnelEvent::ConnectionClosed { .. } => {
                        info!("Tunnel flow closed");
                        outcome = Some(Ok(()));
                    }
                    TunnelEvent::ConnectionAborted { reason, .. } => {
                        warn!("Tunnel flow aborted: {}", reason);
                        outcome = Some(Err(Error::BadConnection(reason)));
                    }
                    TunnelEvent::OpenRequested { .. } => {}
                }
            }
            if let Some(outcome) = outcome {
                break outcome;
            }
        };

        drop(pump);
        if !engine.is_closed() {
            let _ = tokio::time::timeout(
                FLUSH_TIMEOUT,
                flush_pending(&mut write_half, &mut engine),
            )
            .await;
        }
        engine.shutdown("client stopped");
        let _ = write_half.shutdown().await;
        result
    }
}

fn open_error(result: OpenResult) -> Error {
    match result {
        OpenResult::Timeout => Error::Timeout,
        other => Error::BadConnection(format!("server refused the tunnel flow: {:?}", other)),
    }
}

fn notify(events: &Option<mpsc::UnboundedSender<ClientEvent>>, event: ClientEvent) {
    if let Some(events) = events {
        let _ = events.send(event);
    }
}
