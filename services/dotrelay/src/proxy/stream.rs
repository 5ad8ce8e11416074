//! A duplex stream that is either a plain TCP socket or TLS over one.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// Either side of a relayed connection.
pub enum ProxyStream {
    /// Raw TCP, no TLS.
    Plain(TcpStream),
    /// Inbound connection with TLS terminated by the relay.
    ServerTls(Box<server::TlsStream<TcpStream>>),
    /// Upstream connection with TLS originated by the relay.
    ClientTls(Box<client::TlsStream<TcpStream>>),
}

impl ProxyStream {
    /// The underlying TCP socket.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            ProxyStream::Plain(s) => s,
            ProxyStream::ServerTls(s) => s.get_ref().0,
            ProxyStream::ClientTls(s) => s.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, ProxyStream::Plain(_))
    }
}

impl fmt::Debug for ProxyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ProxyStream::Plain(_) => "plain",
            ProxyStream::ServerTls(_) => "server_tls",
            ProxyStream::ClientTls(_) => "client_tls",
        };
        f.debug_struct("ProxyStream")
            .field("kind", &kind)
            .field("peer_addr", &self.peer_addr().ok())
            .finish()
    }
}

impl From<TcpStream> for ProxyStream {
    fn from(stream: TcpStream) -> Self {
        ProxyStream::Plain(stream)
    }
}

impl From<server::TlsStream<TcpStream>> for ProxyStream {
    fn from(stream: server::TlsStream<TcpStream>) -> Self {
        ProxyStream::ServerTls(Box::new(stream))
    }
}

impl From<client::TlsStream<TcpStream>> for ProxyStream {
    fn from(stream: client::TlsStream<TcpStream>) -> Self {
        ProxyStream::ClientTls(Box::new(stream))
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ProxyStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ProxyStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ProxyStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    /// Sends TLS close_notify where applicable, then shuts down the TCP write half.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ProxyStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
