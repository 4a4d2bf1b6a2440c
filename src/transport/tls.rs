//! TLS transport
//!
//! Wraps the TCP transport in TLS 1.2/1.3 using rustls with the ring provider.
//! Servers are verified against the webpki roots plus an optional CA bundle.

use super::tcp::connect_tcp;
use super::{Endpoint, Transport, TransportConfig, TransportError};
use async_trait::async_trait;
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

/// TLS client transport
pub struct TlsTransport {
    config: TransportConfig,
    tls_config: Arc<ClientConfig>,
    sni: Option<String>,
}

impl TlsTransport {
    /// `extra_roots` adds trust anchors, e.g. a private CA
    pub fn new(
        config: TransportConfig,
        extra_roots: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TransportError> {
        let mut root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let (added, ignored) = root_store.add_parsable_certificates(extra_roots);
        if ignored > 0 {
            return Err(TransportError::Tls(format!("{} unusable CA certificate(s)", ignored)));
        }
        debug!("Trusting {} extra CA certificate(s)", added);

        let provider = Arc::new(ring_provider::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            config,
            tls_config: Arc::new(tls_config),
            sni: None,
        })
    }

    /// Trust the CA certificates in a PEM file
    pub fn with_ca_file(
        config: TransportConfig,
        path: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        Self::new(config, load_certs(path)?)
    }

    /// Server name presented in the handshake; defaults to the endpoint host
    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }
}

#[async_trait]
impl Transport for TlsTransport {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Stream, TransportError> {
        let tcp_stream = connect_tcp(&self.config, endpoint).await?;

        let name = self.sni.clone().unwrap_or_else(|| endpoint.host.clone());
        let server_name = ServerName::try_from(name)
            .map_err(|e| TransportError::Tls(format!("Invalid SNI: {}", e)))?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let handshake = connector.connect(server_name, tcp_stream);
        tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

/// Load a certificate chain from a PEM file
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, TransportError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        TransportError::Tls(format!("No private key found in {}", path.display()))
    })
}

/// Build a server config from PEM certificate and key files
pub fn server_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<ServerConfig, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    ServerConfig::builder_with_provider(Arc::new(ring_provider::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}
