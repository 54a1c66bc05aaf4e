//! Stream transports
//!
//! Sessions and clients are written once over the [`StreamFactory`]
//! capability, which turns a freshly accepted or connected TCP socket
//! into the byte stream the connection reads and writes. The plain
//! factory is the identity. The TLS factories run the handshake here,
//! which places it exactly between `on_connect` and the ready state.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use riptide_core::{Error, Result};

use crate::tls::{TlsClientContext, TlsServerContext};

/// Byte stream driven by a session or client.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// Capability that produces session streams from raw TCP sockets.
#[async_trait]
pub trait StreamFactory: Send + Sync + 'static {
    /// Server side: wrap an accepted socket, running any handshake.
    async fn accept_stream(&self, tcp: TcpStream) -> Result<Box<dyn SessionStream>>;

    /// Client side: wrap a connected socket, running any handshake.
    /// `host` is the name the peer certificate is verified against.
    async fn connect_stream(&self, tcp: TcpStream, host: &str) -> Result<Box<dyn SessionStream>>;

    /// Does this transport add a handshake phase before ready?
    fn secured(&self) -> bool {
        false
    }

    /// URL scheme of this transport.
    fn scheme(&self) -> &'static str {
        "tcp"
    }
}

/// Plain TCP: the socket is the stream.
pub struct PlainFactory;

#[async_trait]
impl StreamFactory for PlainFactory {
    async fn accept_stream(&self, tcp: TcpStream) -> Result<Box<dyn SessionStream>> {
        Ok(Box::new(tcp))
    }

    async fn connect_stream(&self, tcp: TcpStream, _host: &str) -> Result<Box<dyn SessionStream>> {
        Ok(Box::new(tcp))
    }
}

/// Server-side TLS over TCP.
pub struct TlsServerFactory {
    acceptor: TlsAcceptor,
}

impl TlsServerFactory {
    pub fn new(context: &TlsServerContext) -> Self {
        Self {
            acceptor: context.acceptor(),
        }
    }
}

#[async_trait]
impl StreamFactory for TlsServerFactory {
    async fn accept_stream(&self, tcp: TcpStream) -> Result<Box<dyn SessionStream>> {
        let stream = self.acceptor.accept(tcp).await?;
        Ok(Box::new(stream))
    }

    async fn connect_stream(&self, _tcp: TcpStream, _host: &str) -> Result<Box<dyn SessionStream>> {
        Err(Error::Config(
            "server transport cannot initiate connections".into(),
        ))
    }

    fn secured(&self) -> bool {
        true
    }

    fn scheme(&self) -> &'static str {
        "tls"
    }
}

/// Client-side TLS over TCP. Every connect attempt builds a fresh TLS
/// stream; reusing one after a failed handshake is unsafe.
pub struct TlsClientFactory {
    connector: TlsConnector,
}

impl TlsClientFactory {
    pub fn new(context: &TlsClientContext) -> Self {
        Self {
            connector: context.connector(),
        }
    }
}

#[async_trait]
impl StreamFactory for TlsClientFactory {
    async fn accept_stream(&self, _tcp: TcpStream) -> Result<Box<dyn SessionStream>> {
        Err(Error::Config("client transport cannot accept".into()))
    }

    async fn connect_stream(&self, tcp: TcpStream, host: &str) -> Result<Box<dyn SessionStream>> {
        let name = ServerName::try_from(host)
            .map_err(|_| Error::Tls(format!("invalid server name: {host}")))?;
        let stream = self.connector.connect(name, tcp).await?;
        Ok(Box::new(stream))
    }

    fn secured(&self) -> bool {
        true
    }

    fn scheme(&self) -> &'static str {
        "tls"
    }
}
