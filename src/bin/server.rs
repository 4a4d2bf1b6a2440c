//! muxtunnel server
//!
//! Accepts tunnel clients over TCP or TLS and serves each one with a
//! [`ServerTunnel`]:
//! - TCP and UDP flows are proxied to their requested destinations
//! - IP flow opens are refused unless a packet gateway is linked in
//! - `fetchConfiguration` is answered from `[server.settings]`

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use muxtunnel::{
    config::{generate_example_config, Config},
    settings::ServerSettings,
    tunnel::ServerTunnel,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Time allowed for a TLS handshake
#[cfg(feature = "tls")]
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// muxtunnel server - multiplexed IP/TCP/UDP tunneling
#[derive(Parser, Debug)]
#[command(name = "muxtunnel-server")]
#[command(about = "muxtunnel server - multiplexed IP/TCP/UDP tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    example_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[cfg(feature = "tls")]
type Acceptor = tokio_rustls::TlsAcceptor;

#[cfg(not(feature = "tls"))]
type Acceptor = ();

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let mut logging = config.logging.clone();
    if let Some(level) = args.log_level {
        logging.level = level;
    }
    logging.init().context("Failed to initialize logging")?;

    let server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    let settings = Arc::new(
        ServerSettings::from_toml(&server_config.settings).context("Invalid [server.settings]")?,
    );
    match settings.pool() {
        Some(_) => info!("IPv4 address pool configured"),
        None => info!("No [server.settings.IPv4] section; IP flows will be refused"),
    }

    let tunnel = Arc::new(
        ServerTunnel::new(settings)
            .with_connect_timeout(Duration::from_secs(server_config.connect_timeout)),
    );

    let acceptor = build_acceptor(
        server_config.tls_cert.as_deref(),
        server_config.tls_key.as_deref(),
    )?;
    let semaphore = Arc::new(Semaphore::new(server_config.max_connections));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listen_addr = args.listen.unwrap_or(server_config.listen);

    info!("muxtunnel server v{}", muxtunnel::VERSION);
    info!("Listening on {}", listen_addr);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            warn!("Connection limit reached, rejecting {}", peer_addr);
                            continue;
                        };
                        debug!("New connection from {}", peer_addr);

                        let tunnel = Arc::clone(&tunnel);
                        let acceptor = acceptor.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            let result =
                                handle_connection(stream, peer_addr, tunnel, acceptor, shutdown)
                                    .await;
                            if let Err(e) = result {
                                debug!("Connection {} ended with error: {:#}", peer_addr, e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    // Let tunnels flush their final close messages
    let _ = tokio::time::timeout(
        Duration::from_secs(3),
        semaphore.acquire_many(server_config.max_connections as u32),
    )
    .await;
    Ok(())
}

#[cfg(feature = "tls")]
fn build_acceptor(cert: Option<&str>, key: Option<&str>) -> Result<Option<Acceptor>> {
    match (cert, key) {
        (Some(cert_path), Some(key_path)) => {
            let tls_config = muxtunnel::transport::server_config_from_pem(cert_path, key_path)
                .context("Failed to build TLS server config")?;
            info!("TLS enabled with cert: {}", cert_path);
            Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config))))
        }
        (None, None) => {
            info!("TLS disabled (no tls_cert/tls_key configured)");
            Ok(None)
        }
        _ => Err(anyhow!("tls_cert and tls_key must be set together")),
    }
}

#[cfg(not(feature = "tls"))]
fn build_acceptor(cert: Option<&str>, key: Option<&str>) -> Result<Option<Acceptor>> {
    if cert.is_some() || key.is_some() {
        return Err(anyhow!("TLS configured but this build lacks the `tls` feature"));
    }
    Ok(None)
}

/// Serve one client, over TLS when an acceptor is configured
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tunnel: Arc<ServerTunnel>,
    acceptor: Option<Acceptor>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true).ok();

    match acceptor {
        #[cfg(feature = "tls")]
        Some(acceptor) => {
            let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| anyhow!("TLS handshake timed out"))?
                .context("TLS handshake failed")?;
            debug!("TLS handshake with {} complete", peer_addr);
            serve(tls_stream, peer_addr, &tunnel, shutdown).await
        }
        _ => serve(stream, peer_addr, &tunnel, shutdown).await,
    }
}

async fn serve<S>(
    stream: S,
    peer_addr: SocketAddr,
    tunnel: &ServerTunnel,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("Tunnel from {} started", peer_addr);
    let stopped = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };
    tunnel
        .run(stream, stopped)
        .await
        .with_context(|| format!("Tunnel from {} failed", peer_addr))?;
    info!("Tunnel from {} finished", peer_addr);
    Ok(())
}
