//! Client-facing sockets, plain or TLS.
//!
//! [`Listener::accept`] only takes a TCP connection off the backlog. The TLS
//! handshake is left to [`Incoming::establish`], which runs on the
//! connection's own task so a stalled peer never holds up the accept loop.

use anyhow::Result;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::TlsConfig;

pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub async fn bind(addr: &str, tls: Option<TlsAcceptor>) -> io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        Ok(Self { tcp, tls })
    }

    /// Next TCP connection, without any handshake
    pub async fn accept(&self) -> io::Result<Incoming> {
        let (stream, peer) = self.tcp.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Incoming {
            stream,
            peer,
            tls: self.tls.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// An accepted connection that has not been through TLS yet
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Run the TLS handshake when the listener has TLS configured.
    ///
    /// Has no deadline of its own; callers bound it.
    pub async fn establish(self) -> io::Result<ClientStream> {
        match self.tls {
            Some(acceptor) => {
                let stream = acceptor.accept(self.stream).await?;
                Ok(ClientStream::Tls(Box::new(stream)))
            }
            None => Ok(ClientStream::Plain(self.stream)),
        }
    }
}

/// Byte stream under a client's WebSocket
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Load the certificate chain and private key named by the TLS config
pub fn build_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    use rustls_pemfile::{certs, private_key};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls::ServerConfig;

    let cert_file = File::open(&tls_config.cert_file)?;
    let key_file = File::open(&tls_config.key_file)?;

    let chain = certs(&mut BufReader::new(cert_file)).collect::<io::Result<Vec<_>>>()?;
    if chain.is_empty() {
        anyhow::bail!("No certificate found in {}", tls_config.cert_file.display());
    }

    let key = private_key(&mut BufReader::new(key_file))?.ok_or_else(|| {
        anyhow::anyhow!("No private key found in {}", tls_config.key_file.display())
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
