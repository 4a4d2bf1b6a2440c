//! Transport layer implementations
//!
//! Provides the byte streams the tunnel runs over:
//! - TCP (plain, for testing and internal networks)
//! - TLS 1.3 via rustls

mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use tcp::TcpTransport;

#[cfg(feature = "tls")]
pub use tls::{load_certs, load_private_key, server_config_from_pem, TlsTransport};

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Remote tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`; IPv6 hosts are bracketed
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Something that can open a stream to the tunnel server
#[async_trait]
pub trait Transport: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Stream, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connect (and TLS handshake) timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("vpn.example.com:443").unwrap();
        assert_eq!(endpoint, Endpoint::new("vpn.example.com", 443));
        assert_eq!(endpoint.to_string(), "vpn.example.com:443");

        let v6 = Endpoint::parse("[::1]:8443").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:8443");
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        for bad in [":80", "host:", "host", "host:99999", "[]:80"] {
            assert!(Endpoint::parse(bad).is_err(), "{} should not parse", bad);
        }
    }
}
