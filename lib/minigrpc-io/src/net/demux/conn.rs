use std::{
    future::Future as _,
    io::{self, IoSlice},
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_util::sync::WaitForCancellationFutureOwned;

use super::rewind::Rewind;
use crate::net::{addr::ConnectionAddress, stream::Connection};

/// The transport of an accepted connection: either the raw stream, or the raw stream wrapped in a server-side TLS
/// session.
#[pin_project(project = TransportProjected)]
pub(super) enum Transport {
    Plain(#[pin] Connection),
    Tls(#[pin] Box<TlsStream<Connection>>),
}

impl Transport {
    pub(super) const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProjected::Plain(inner) => inner.poll_read(cx, buf),
            TransportProjected::Tls(inner) => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProjected::Plain(inner) => inner.poll_write(cx, buf),
            TransportProjected::Tls(inner) => inner.poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>, cx: &mut Context<'_>, bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProjected::Plain(inner) => inner.poll_write_vectored(cx, bufs),
            TransportProjected::Tls(inner) => inner.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(inner) => inner.is_write_vectored(),
            Self::Tls(inner) => inner.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProjected::Plain(inner) => inner.poll_flush(cx),
            TransportProjected::Tls(inner) => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProjected::Plain(inner) => inner.poll_shutdown(cx),
            TransportProjected::Tls(inner) => inner.poll_shutdown(cx),
        }
    }
}

/// Connection metadata attached to every request served over a demultiplexed connection.
///
/// Servers built on tonic expose this through the request extensions.
#[derive(Clone, Debug)]
pub struct MuxedConnectInfo {
    remote_addr: ConnectionAddress,
    route: &'static str,
    tls: bool,
}

impl MuxedConnectInfo {
    /// Returns the address of the remote peer.
    pub fn remote_addr(&self) -> &ConnectionAddress {
        &self.remote_addr
    }

    /// Returns the name of the route the connection was delivered to.
    pub fn route(&self) -> &'static str {
        self.route
    }

    /// Returns `true` if the connection is protected by TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

/// A connection handed out by the demultiplexer.
///
/// Reads first replay the bytes consumed while sniffing the connection, then continue from the underlying transport.
/// Once the demultiplexer is severed, every read and write fails with [`io::ErrorKind::ConnectionAborted`], which
/// tears down whatever protocol state machine is driving the connection.
pub struct MuxedConnection {
    io: Rewind<Transport>,
    info: MuxedConnectInfo,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl MuxedConnection {
    pub(super) fn new(
        transport: Transport, sniffed: Bytes, remote_addr: ConnectionAddress, route: &'static str,
        severed: WaitForCancellationFutureOwned,
    ) -> Self {
        let info = MuxedConnectInfo {
            remote_addr,
            route,
            tls: transport.is_tls(),
        };

        Self {
            io: Rewind::new(sniffed, transport),
            info,
            severed: Box::pin(severed),
        }
    }

    /// Returns the connection metadata.
    pub fn info(&self) -> &MuxedConnectInfo {
        &self.info
    }

    fn poll_severed(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        self.severed
            .as_mut()
            .poll(cx)
            .map(|()| io::Error::new(io::ErrorKind::ConnectionAborted, "connection severed"))
    }
}

impl AsyncRead for MuxedConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }

        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxedConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }

        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>, cx: &mut Context<'_>, bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }

        Pin::new(&mut this.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }

        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_severed(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

impl tonic::transport::server::Connected for MuxedConnection {
    type ConnectInfo = MuxedConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}
