//! Byte-stream transports the orchestrator connects slots with.

use crate::error::ConnectError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};

/// Opens one connection to `addr`. `server_name` is the host the request
/// will carry and, for TLS, the SNI name the certificate must match.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> Result<Self::Stream, ConnectError>;
}

async fn tcp_connect(addr: SocketAddr) -> Result<TcpStream, ConnectError> {
    let stream = TcpStream::connect(addr).await.map_err(ConnectError::tcp)?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%addr, error = %e, "could not disable nagle");
    }
    Ok(stream)
}

/// Plain TCP, for local endpoints and tests.
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        _server_name: &str,
    ) -> Result<TcpStream, ConnectError> {
        tcp_connect(addr).await
    }
}

/// TCP followed by a rustls client handshake verified against the webpki
/// root set.
#[derive(Clone)]
pub struct TlsTransport {
    connector: TlsConnector,
}

impl TlsTransport {
    pub fn new() -> Result<Self, ConnectError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    pub fn with_roots(roots: RootCertStore) -> Result<Self, ConnectError> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(TlsTransport {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    type Stream = TlsStream<TcpStream>;

    fn name(&self) -> &'static str {
        "tls"
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> Result<Self::Stream, ConnectError> {
        let domain = ServerName::try_from(server_name.to_string())
            .map_err(|_| ConnectError::InvalidServerName(server_name.to_string()))?;
        let stream = tcp_connect(addr).await?;
        self.connector
            .connect(domain, stream)
            .await
            .map_err(ConnectError::tls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tls_rejects_invalid_server_name() {
        let transport = TlsTransport::new().unwrap();
        let err = transport
            .connect("127.0.0.1:9".parse().unwrap(), "not a host name")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidServerName(_)));
    }

    #[tokio::test]
    async fn tcp_connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpTransport.connect(addr, "localhost").await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert!(stream.nodelay().unwrap());
    }
}
