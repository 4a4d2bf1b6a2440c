//! muxtunnel client
//!
//! Diagnostic front-end for the tunnel client:
//! - Connects to the server over TCP or TLS
//! - Opens the IP flow and logs the network settings it receives
//! - Optionally fetches and prints the server's configuration document
//!
//! Packet capture is platform specific, so this binary sends no packets and
//! logs the ones it receives.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use muxtunnel::{
    config::{ClientConfig, Config},
    protocol::Packet,
    settings::NetworkSettings,
    transport::{Endpoint, TcpTransport, TransportConfig},
    tunnel::{ClientEvent, ClientTunnel, PacketSink, PacketSource, SettingsApplier},
};
use std::io;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// muxtunnel client - multiplexed IP/TCP/UDP tunneling
#[derive(Parser, Debug)]
#[command(name = "muxtunnel-client")]
#[command(about = "muxtunnel client - multiplexed IP/TCP/UDP tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Connect without TLS
    #[arg(long)]
    no_tls: bool,

    /// Fetch and print the server configuration
    #[arg(long)]
    fetch_configuration: bool,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Logs settings instead of configuring an interface
struct LoggingApplier;

#[async_trait]
impl SettingsApplier for LoggingApplier {
    async fn apply(&mut self, settings: &NetworkSettings) -> io::Result<()> {
        info!(
            "Interface address {} netmask {} (full tunnel: {})",
            settings.address, settings.netmask, settings.full_tunnel
        );
        for route in &settings.included_routes {
            info!("Route {} / {}", route.destination, route.netmask);
        }
        if let Some(dns) = &settings.dns {
            info!("DNS servers {:?}, search domains {:?}", dns.servers, dns.search_domains);
        }
        Ok(())
    }
}

/// Never produces packets
struct IdleSource;

#[async_trait]
impl PacketSource for IdleSource {
    async fn read_packets(&mut self) -> io::Result<Vec<Packet>> {
        std::future::pending().await
    }
}

struct LoggingSink;

impl PacketSink for LoggingSink {
    fn write_packets(&mut self, packets: Vec<Packet>) -> io::Result<()> {
        for packet in packets {
            debug!("Received {:?} packet, {} bytes", packet.protocol, packet.data.len());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let mut logging = config.logging.clone();
    if let Some(level) = args.log_level {
        logging.level = level;
    }
    logging.init().context("Failed to initialize logging")?;

    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if args.no_tls {
        client_config.tls = false;
    }
    client_config.fetch_configuration |= args.fetch_configuration;

    let endpoint = Endpoint::parse(&client_config.server).context("Invalid server address")?;

    info!("muxtunnel client v{}", muxtunnel::VERSION);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ClientEvent::Established(settings) => {
                    info!("Tunnel up via {}", settings.tunnel_remote_address);
                }
                ClientEvent::Configuration(configuration) => {
                    println!("Server configuration:");
                    for (key, value) in configuration.iter() {
                        println!("  {} = {:?}", key, value);
                    }
                }
            }
        }
    });

    let tunnel = ClientTunnel::new(
        endpoint.host.clone(),
        Box::new(IdleSource),
        Box::new(LoggingSink),
        Box::new(LoggingApplier),
    )
    .fetch_configuration(client_config.fetch_configuration)
    .with_events(events_tx);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Disconnecting...");
    };

    connect(tunnel, &client_config, &endpoint, shutdown)
        .await
        .context("Tunnel failed")?;
    info!("Tunnel closed");
    Ok(())
}

#[cfg(feature = "tls")]
async fn connect<F>(
    tunnel: ClientTunnel,
    config: &ClientConfig,
    endpoint: &Endpoint,
    shutdown: F,
) -> muxtunnel::Result<()>
where
    F: std::future::Future<Output = ()> + Send,
{
    use muxtunnel::transport::TlsTransport;

    if !config.tls {
        return tunnel
            .connect(&TcpTransport::new(TransportConfig::default()), endpoint, shutdown)
            .await;
    }

    let transport = match &config.tls_ca {
        Some(ca) => TlsTransport::with_ca_file(TransportConfig::default(), ca)?,
        None => TlsTransport::new(TransportConfig::default(), Vec::new())?,
    };
    let transport = match &config.tls_sni {
        Some(sni) => transport.with_sni(sni.clone()),
        None => transport,
    };
    tunnel.connect(&transport, endpoint, shutdown).await
}

#[cfg(not(feature = "tls"))]
async fn connect<F>(
    tunnel: ClientTunnel,
    config: &ClientConfig,
    endpoint: &Endpoint,
    shutdown: F,
) -> muxtunnel::Result<()>
where
    F: std::future::Future<Output = ()> + Send,
{
    if config.tls {
        return Err(muxtunnel::Error::BadConfiguration(
            "TLS requested but this build lacks the `tls` feature".to_string(),
        ));
    }
    tunnel
        .connect(&TcpTransport::new(TransportConfig::default()), endpoint, shutdown)
        .await
}
