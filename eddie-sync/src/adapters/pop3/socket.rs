//! Transport for POP3 connections: plain TCP, implicit TLS, and STLS upgrade.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Byte stream the POP3 connection task reads and writes.
#[async_trait]
pub trait Pop3Stream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Replace this stream with a TLS session over it (STLS).
    async fn upgrade_to_secure(self: Box<Self>, host: &str) -> io::Result<Box<dyn Pop3Stream>>;
}

#[async_trait]
impl Pop3Stream for TcpStream {
    async fn upgrade_to_secure(self: Box<Self>, host: &str) -> io::Result<Box<dyn Pop3Stream>> {
        info!("Upgrading POP3 connection to {} to TLS", host);
        let tls = tls_handshake(host, *self).await?;
        Ok(Box::new(tls))
    }
}

#[async_trait]
impl Pop3Stream for TlsStream<TcpStream> {
    async fn upgrade_to_secure(self: Box<Self>, _host: &str) -> io::Result<Box<dyn Pop3Stream>> {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "connection is already secure",
        ))
    }
}

fn tls_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

async fn tls_handshake(host: &str, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("Invalid hostname: {}", e)))?;

    tls_connector().connect(server_name, stream).await
}

/// Open a connection, racing the whole setup (TCP + TLS) against `conn_timeout`.
pub async fn open(
    host: &str,
    port: u16,
    use_tls: bool,
    conn_timeout: Duration,
) -> io::Result<Box<dyn Pop3Stream>> {
    let addr = format!("{}:{}", host, port);
    debug!("Opening POP3 socket to {} (tls: {})", addr, use_tls);

    let setup = async {
        let stream = TcpStream::connect(&addr).await?;
        if use_tls {
            let tls = tls_handshake(host, stream).await?;
            Ok::<Box<dyn Pop3Stream>, io::Error>(Box::new(tls))
        } else {
            Ok(Box::new(stream) as Box<dyn Pop3Stream>)
        }
    };

    timeout(conn_timeout, setup).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("Could not connect to {} within {:?}", addr, conn_timeout),
        )
    })?
}

/// In-memory streams stand in for sockets in tests; "upgrading" is a no-op.
#[cfg(test)]
#[async_trait]
impl Pop3Stream for tokio::io::DuplexStream {
    async fn upgrade_to_secure(self: Box<Self>, _host: &str) -> io::Result<Box<dyn Pop3Stream>> {
        Ok(self)
    }
}
