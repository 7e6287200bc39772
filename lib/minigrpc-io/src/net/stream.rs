use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::addr::ConnectionAddress;

/// An accepted, connection-oriented byte stream.
#[pin_project(project = ConnectionProjected)]
pub enum Connection {
    /// A TCP connection, along with the address of the remote peer.
    Tcp(#[pin] TcpStream, SocketAddr),

    /// A Unix domain socket connection.
    #[cfg(unix)]
    Unix(#[pin] tokio::net::UnixStream),
}

impl Connection {
    /// Returns the address of the remote peer.
    pub fn remote_addr(&self) -> ConnectionAddress {
        match self {
            Self::Tcp(_, addr) => ConnectionAddress::SocketLike(*addr),
            #[cfg(unix)]
            Self::Unix(_) => ConnectionAddress::Unix,
        }
    }

    /// Returns the remote socket address, if the connection is over TCP.
    pub fn remote_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(_, addr) => Some(*addr),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    /// Returns the transport name of the connection.
    pub const fn transport(&self) -> &'static str {
        match self {
            Self::Tcp(..) => "tcp",
            #[cfg(unix)]
            Self::Unix(_) => "unix",
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_read(cx, buf),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_write(cx, buf),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_flush(cx),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_shutdown(cx),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_shutdown(cx),
        }
    }
}
