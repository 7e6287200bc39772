//! Network listeners.
use std::{io, net::SocketAddr};

use snafu::{ResultExt as _, Snafu};
use tokio::net::TcpListener;
use tracing::debug;

use super::{addr::ListenAddress, stream::Connection};
#[cfg(unix)]
use super::unix::{ensure_unix_socket_free, set_unix_socket_connectable};

/// A listener error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ListenerError {
    /// An invalid configuration was given when creating the listener.
    #[snafu(display("invalid configuration: {}", reason))]
    InvalidConfiguration {
        /// Cause of the invalid configuration.
        reason: &'static str,
    },

    /// Failed to bind to the listen address.
    #[snafu(display("failed to bind to listen address {}: {}", address, source))]
    FailedToBind {
        /// Listen address.
        address: ListenAddress,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to configure a setting on the listening socket.
    #[snafu(display("failed to configure {} for listener on address {}: {}", setting, address, source))]
    FailedToConfigureListener {
        /// Listen address.
        address: ListenAddress,

        /// Name of the setting.
        setting: &'static str,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to accept a new connection from the listener.
    #[snafu(display("failed to accept new connection for listener on address {}: {}", address, source))]
    FailedToAccept {
        /// Listen address.
        address: ListenAddress,

        /// Source of the error.
        source: io::Error,
    },
}

impl ListenerError {
    /// Returns the underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::InvalidConfiguration { .. } => None,
            Self::FailedToBind { source, .. }
            | Self::FailedToConfigureListener { source, .. }
            | Self::FailedToAccept { source, .. } => Some(source),
        }
    }
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// A connection-oriented network listener.
///
/// gRPC is carried over HTTP/2, which needs a reliable byte stream, so only TCP and Unix domain sockets in stream mode
/// can be listened on. Listen addresses for connectionless transports are rejected with
/// [`ListenerError::InvalidConfiguration`].
pub struct ConnectionOrientedListener {
    listen_address: ListenAddress,
    inner: ListenerInner,
}

impl ConnectionOrientedListener {
    /// Creates a new `ConnectionOrientedListener` from the given listen address.
    ///
    /// ## Errors
    ///
    /// If the listen address is not a connection-oriented address family, or if the listen address cannot be bound, or
    /// if the listener cannot be configured correctly, an error is returned.
    pub async fn from_listen_address(listen_address: ListenAddress) -> Result<Self, ListenerError> {
        let inner = match &listen_address {
            ListenAddress::Tcp(addr) => TcpListener::bind(addr)
                .await
                .map(ListenerInner::Tcp)
                .context(FailedToBind {
                    address: listen_address.clone(),
                })?,
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                ensure_unix_socket_free(path).await.context(FailedToBind {
                    address: listen_address.clone(),
                })?;

                let listener = tokio::net::UnixListener::bind(path)
                    .map(ListenerInner::Unix)
                    .context(FailedToBind {
                        address: listen_address.clone(),
                    })?;
                set_unix_socket_connectable(path)
                    .await
                    .context(FailedToConfigureListener {
                        address: listen_address.clone(),
                        setting: "read/write permissions",
                    })?;

                listener
            }
            _ => {
                return Err(ListenerError::InvalidConfiguration {
                    reason: "only TCP and Unix stream listen addresses are supported",
                })
            }
        };

        debug!(listen_addr = %listen_address, "Listener bound.");

        Ok(Self { listen_address, inner })
    }

    /// Gets a reference to the configured listen address.
    pub fn listen_address(&self) -> &ListenAddress {
        &self.listen_address
    }

    /// Returns the address the listener is actually bound to.
    ///
    /// For TCP listeners configured with port 0, this carries the port the operating system picked. Unix listeners
    /// return their configured address unchanged.
    ///
    /// ## Errors
    ///
    /// If the local address of the underlying socket cannot be queried, an error is returned.
    pub fn local_addr(&self) -> io::Result<ListenAddress> {
        match &self.inner {
            ListenerInner::Tcp(tcp) => tcp.local_addr().map(ListenAddress::Tcp),
            #[cfg(unix)]
            ListenerInner::Unix(_) => Ok(self.listen_address.clone()),
        }
    }

    /// Returns the bound TCP socket address, if this is a TCP listener.
    pub fn local_socket_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            ListenerInner::Tcp(tcp) => tcp.local_addr().ok(),
            #[cfg(unix)]
            ListenerInner::Unix(_) => None,
        }
    }

    /// Accepts a new connection from the listener.
    ///
    /// ## Errors
    ///
    /// If the listener fails to accept a new connection, an error is returned.
    pub async fn accept(&mut self) -> Result<Connection, ListenerError> {
        match &mut self.inner {
            ListenerInner::Tcp(tcp) => {
                tcp.accept()
                    .await
                    .map(|(stream, addr)| Connection::Tcp(stream, addr))
                    .context(FailedToAccept {
                        address: self.listen_address.clone(),
                    })
            }
            #[cfg(unix)]
            ListenerInner::Unix(unix) => unix
                .accept()
                .await
                .map(|(stream, _)| Connection::Unix(stream))
                .context(FailedToAccept {
                    address: self.listen_address.clone(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    #[tokio::test]
    async fn rejects_connectionless_addresses() {
        let address = ListenAddress::try_from("udp://127.0.0.1:0").unwrap();
        let result = ConnectionOrientedListener::from_listen_address(address).await;
        assert!(matches!(result, Err(ListenerError::InvalidConfiguration { .. })));
    }

    #[tokio::test]
    async fn port_in_use_fails_to_bind() {
        let first = ConnectionOrientedListener::from_listen_address(ListenAddress::local_tcp(0))
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let result = ConnectionOrientedListener::from_listen_address(taken).await;
        match result {
            Err(ListenerError::FailedToBind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second bind on the same port should fail"),
        }
    }

    #[tokio::test]
    async fn accepts_tcp_connections() {
        let mut listener = ConnectionOrientedListener::from_listen_address(ListenAddress::local_tcp(0))
            .await
            .unwrap();
        let addr = listener.local_socket_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let mut conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(matches!(conn.remote_addr(), crate::net::ConnectionAddress::SocketLike(_)));

        client.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn accepts_unix_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minigrpc.sock");
        let address = ListenAddress::Unix(path.clone());

        let mut listener = ConnectionOrientedListener::from_listen_address(address.clone())
            .await
            .unwrap();
        assert_eq!(listener.local_addr().unwrap(), address);

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::UnixStream::connect(path).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let mut conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.await.unwrap();
    }
}
