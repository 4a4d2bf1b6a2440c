//! Plain TCP transport (for testing and internal networks)

use super::{Endpoint, Transport, TransportConfig, TransportError};
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Connect a TCP stream with the configured timeout and socket options
pub(crate) async fn connect_tcp(
    config: &TransportConfig,
    endpoint: &Endpoint,
) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| TransportError::Timeout)?
    .map_err(TransportError::Io)?;

    if config.nodelay {
        stream.set_nodelay(true).ok();
    }
    Ok(stream)
}

/// Plain TCP transport
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, TransportError> {
        connect_tcp(&self.config, endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport() {
        // Echo one read back
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let transport = TcpTransport::default();
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let mut stream = transport.connect(&endpoint).await.unwrap();

        let msg = b"Hello, TCP!";
        stream.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(TransportConfig {
            connect_timeout: Duration::from_secs(2),
            nodelay: true,
        });
        let result = transport.connect(&Endpoint::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
