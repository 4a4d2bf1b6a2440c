//! # muxtunnel
//!
//! Multiplexes IP packet flows and proxied TCP and UDP flows over a single
//! reliable byte stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Client / Server drivers (tokio tasks)         │
//! │   IP flow + settings │ TCP/UDP proxy, address pool   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel engine                       │
//! │   (logical connections, half-close, flow control)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Message codec                       │
//! │       (length-prefixed typed property maps)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport layer                     │
//! │                    (TCP, TLS)                        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod protocol;
pub mod settings;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port for the tunnel server
pub const DEFAULT_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(tunnel::TunnelError),

    #[error("Settings error: {0}")]
    Settings(#[from] settings::SettingsError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The tunnel's network settings could not be applied
    #[error("Bad configuration: {0}")]
    BadConfiguration(String),

    /// The server refused or tore down the tunnel
    #[error("Bad connection: {0}")]
    BadConnection(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

impl From<tunnel::TunnelError> for Error {
    fn from(e: tunnel::TunnelError) -> Self {
        match e {
            tunnel::TunnelError::Protocol(e) => Error::Protocol(e),
            tunnel::TunnelError::Io(e) => Error::Io(e),
            other => Error::Tunnel(other),
        }
    }
}

impl From<transport::TransportError> for Error {
    fn from(e: transport::TransportError) -> Self {
        match e {
            transport::TransportError::InvalidEndpoint(endpoint) => {
                Error::BadConfiguration(format!("invalid server address: {}", endpoint))
            }
            transport::TransportError::Io(e) => Error::Io(e),
            transport::TransportError::Timeout => Error::Timeout,
            transport::TransportError::Closed => Error::ConnectionClosed,
            other => Error::Transport(other),
        }
    }
}
