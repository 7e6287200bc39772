use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use url::Url;

/// A listen address.
///
/// Listen addresses are used to bind listeners to specific local addresses and ports. In textual form, listen addresses
/// are represented as URLs, with the scheme indicating the protocol and the authority/path representing the address to
/// listen on.
///
/// Connectionless schemes (`udp`, `unixgram`) can be parsed so that they can be rejected with a meaningful error, but
/// only connection-oriented addresses can actually be listened on.
///
/// ## Examples
///
/// - `tcp://127.0.0.1:6789` (listen on IPv4 loopback, TCP port 6789)
/// - `tcp://[::]:9003` (listen on all IPv6 interfaces, TCP port 9003)
/// - `unix:///tmp/app.socket` (listen on a Unix stream socket at `/tmp/app.socket`)
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String")]
pub enum ListenAddress {
    /// A TCP listen address.
    Tcp(SocketAddr),

    /// A UDP listen address.
    Udp(SocketAddr),

    /// A Unix datagram listen address.
    #[cfg(unix)]
    Unixgram(PathBuf),

    /// A Unix stream listen address.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl ListenAddress {
    /// Creates a TCP address for the given port that listens on all interfaces.
    pub const fn any_tcp(port: u16) -> Self {
        Self::Tcp(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Creates a TCP address for the given port that listens only on the IPv4 loopback interface.
    pub const fn local_tcp(port: u16) -> Self {
        Self::Tcp(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }

    /// Returns the socket type of the listen address.
    pub const fn listener_type(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
            #[cfg(unix)]
            Self::Unixgram(_) => "unixgram",
            #[cfg(unix)]
            Self::Unix(_) => "unix",
        }
    }

    /// Returns `true` if the address uses a connection-oriented transport (TCP, or Unix domain sockets in SOCK_STREAM
    /// mode).
    pub const fn is_connection_oriented(&self) -> bool {
        match self {
            Self::Tcp(_) => true,
            #[cfg(unix)]
            Self::Unix(_) => true,
            _ => false,
        }
    }

    /// Returns the port of the listen address, if it has one.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp(addr) | Self::Udp(addr) => Some(addr.port()),
            #[cfg(unix)]
            Self::Unixgram(_) | Self::Unix(_) => None,
        }
    }

    /// Returns a socket address that can be used to connect to the configured listen address with a bias for local clients.
    ///
    /// When the listen address is a TCP or UDP address, this method returns a socket address that can be used to
    /// connect to the listener bound to this listen address, such that if the listen address is unspecified
    /// (`0.0.0.0`), the client will connect locally using "localhost". When the listen address is not "unspecified" or
    /// already uses "localhost", this method returns the listen address as-is.
    ///
    /// If the address is a Unix domain socket, this method returns `None`.
    pub fn as_local_connect_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) | Self::Udp(addr) => {
                let mut connect_addr = *addr;
                if connect_addr.ip().is_unspecified() {
                    let localhost_ip = match connect_addr.is_ipv4() {
                        true => IpAddr::V4(Ipv4Addr::LOCALHOST),
                        false => IpAddr::V6(Ipv6Addr::LOCALHOST),
                    };

                    connect_addr.set_ip(localhost_ip);
                }

                Some(connect_addr)
            }
            #[cfg(unix)]
            Self::Unixgram(_) | Self::Unix(_) => None,
        }
    }

    /// Returns the Unix domain socket path if the address is a Unix domain socket in SOCK_STREAM mode.
    ///
    /// Returns `None` otherwise.
    pub fn as_unix_stream_path(&self) -> Option<&Path> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
            Self::Udp(addr) => write!(f, "udp://{}", addr),
            #[cfg(unix)]
            Self::Unixgram(path) => write!(f, "unixgram://{}", path.display()),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl TryFrom<String> for ListenAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl<'a> TryFrom<&'a str> for ListenAddress {
    type Error = String;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        let url = Url::parse(value).map_err(|e| e.to_string())?;

        match url.scheme() {
            "tcp" => Ok(Self::Tcp(first_socket_addr(&url)?)),
            "udp" => Ok(Self::Udp(first_socket_addr(&url)?)),
            #[cfg(unix)]
            "unixgram" => Ok(Self::Unixgram(absolute_socket_path(&url)?)),
            #[cfg(unix)]
            "unix" => Ok(Self::Unix(absolute_socket_path(&url)?)),
            scheme => Err(format!("unknown/unsupported address scheme '{}'", scheme)),
        }
    }
}

fn first_socket_addr(url: &Url) -> Result<SocketAddr, String> {
    let mut socket_addresses = url.socket_addrs(|| None).map_err(|e| e.to_string())?;
    if socket_addresses.is_empty() {
        Err("listen address must resolve to at least one valid IP address/port pair".to_string())
    } else {
        Ok(socket_addresses.swap_remove(0))
    }
}

#[cfg(unix)]
fn absolute_socket_path(url: &Url) -> Result<PathBuf, String> {
    let path = url.path();
    if path.is_empty() {
        return Err("socket path cannot be empty".to_string());
    }

    let path_buf = PathBuf::from(path);
    if !path_buf.is_absolute() {
        return Err("socket path must be absolute".to_string());
    }

    Ok(path_buf)
}

/// Connection address.
///
/// The address of a remote peer: either a typical socket address (IPv4/IPv6), or an unnamed Unix domain socket peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionAddress {
    /// A socket-like address.
    SocketLike(SocketAddr),

    /// A Unix domain socket peer.
    #[cfg(unix)]
    Unix,
}

impl fmt::Display for ConnectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketLike(addr) => write!(f, "{}", addr),
            #[cfg(unix)]
            Self::Unix => write!(f, "<unix>"),
        }
    }
}

impl From<SocketAddr> for ConnectionAddress {
    fn from(value: SocketAddr) -> Self {
        Self::SocketLike(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_local_connect_addr() {
        let tcp_any_addr = ListenAddress::try_from("tcp://0.0.0.0:1234").unwrap();
        assert_eq!(
            tcp_any_addr.as_local_connect_addr(),
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234)))
        );

        let tcp_private_addr = ListenAddress::try_from("tcp://192.168.10.2:3456").unwrap();
        assert_eq!(
            tcp_private_addr.as_local_connect_addr(),
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 10, 2), 3456)))
        );

        let tcp_v6_any_addr = ListenAddress::try_from("tcp://[::]:9003").unwrap();
        assert_eq!(
            tcp_v6_any_addr.as_local_connect_addr(),
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9003))
        );
    }

    #[test]
    fn any_tcp_round_trips_through_display() {
        let addr = ListenAddress::any_tcp(9003);
        assert_eq!(addr.to_string(), "tcp://0.0.0.0:9003");
        assert_eq!(ListenAddress::try_from(addr.to_string()).unwrap(), addr);
        assert_eq!(addr.port(), Some(9003));
    }

    #[test]
    fn connection_orientation() {
        assert!(ListenAddress::any_tcp(1).is_connection_oriented());
        assert!(!ListenAddress::try_from("udp://127.0.0.1:53")
            .unwrap()
            .is_connection_oriented());

        #[cfg(unix)]
        {
            assert!(ListenAddress::try_from("unix:///tmp/minigrpc.sock")
                .unwrap()
                .is_connection_oriented());
            assert!(!ListenAddress::try_from("unixgram:///tmp/minigrpc.sock")
                .unwrap()
                .is_connection_oriented());
        }
    }

    #[test]
    fn rejects_unknown_scheme_and_relative_paths() {
        assert!(ListenAddress::try_from("http://127.0.0.1:80").is_err());
        assert!(ListenAddress::try_from("not a url").is_err());
    }
}
