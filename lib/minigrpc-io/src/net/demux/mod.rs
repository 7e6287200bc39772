//! Protocol demultiplexing.
//!
//! A [`Demultiplexer`] owns a single listening socket and hands each accepted connection to exactly one
//! [`SubListener`], chosen by sniffing the first application bytes the client sends. When TLS is configured, the
//! handshake happens before sniffing, so every route sees plaintext application bytes.
//!
//! Routes are matched in the order they were registered, and the first matching route wins. A typical setup registers
//! [`Matcher::Http1`] first (gRPC-Web and other HTTP/1.x clients) and [`Matcher::Any`] last (native gRPC over HTTP/2).
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::BytesMut;
use futures::Stream;
use metrics::counter;
use rustls::ServerConfig;
use snafu::{ResultExt as _, Snafu};
use tokio::{
    io::AsyncReadExt as _,
    sync::mpsc,
    time::{sleep, timeout, Instant},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    addr::{ConnectionAddress, ListenAddress},
    listener::{ConnectionOrientedListener, ListenerError},
    stream::Connection,
};
use crate::spawn_traced;

mod conn;
pub use self::conn::{MuxedConnectInfo, MuxedConnection};
use self::conn::Transport;

mod matcher;
pub use self::matcher::Matcher;
use self::matcher::{select_route, Decision, MAX_SNIFF_LEN};

mod rewind;
pub use self::rewind::Rewind;

const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);
const SUB_LISTENER_BACKLOG: usize = 128;
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// A demultiplexer error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DemuxError {
    /// The demultiplexer was closed through its handle.
    ///
    /// This is the expected outcome of a deliberate shutdown.
    #[snafu(display("listener closed"))]
    Closed,

    /// The underlying listener failed to accept a connection.
    #[snafu(display("failed to accept connection: {}", source))]
    Accept {
        /// Source of the error.
        source: ListenerError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
enum SniffError {
    #[snafu(display("TLS handshake failed: {}", source))]
    Handshake { source: io::Error },

    #[snafu(display("failed to read initial bytes: {}", source))]
    Read { source: io::Error },

    #[snafu(display("peer closed the connection before sending any data"))]
    PeerClosed,

    #[snafu(display("no route matched the initial bytes"))]
    Unmatched,
}

impl SniffError {
    const fn reason(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Read { .. } => "read",
            Self::PeerClosed => "peer_closed",
            Self::Unmatched => "unmatched",
        }
    }
}

/// A stream of connections delivered to one route of a [`Demultiplexer`].
///
/// The stream ends once the demultiplexer is closed and every connection already routed here has been yielded. Items
/// are always `Ok`; the `Result` wrapper lets the stream be handed directly to servers that accept a stream of
/// fallible connections.
pub struct SubListener {
    route: &'static str,
    rx: mpsc::Receiver<MuxedConnection>,
}

impl SubListener {
    /// Returns the name of the route this sub-listener receives connections for.
    pub fn route(&self) -> &'static str {
        self.route
    }
}

impl Stream for SubListener {
    type Item = Result<MuxedConnection, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|maybe_conn| maybe_conn.map(Ok))
    }
}

/// A handle for stopping a [`Demultiplexer`] from another task.
///
/// Both operations are idempotent.
#[derive(Clone)]
pub struct DemuxHandle {
    closed: CancellationToken,
    severed: CancellationToken,
}

impl DemuxHandle {
    /// Stops accepting new connections.
    ///
    /// The listening socket is released, connections still being sniffed are dropped, and every sub-listener stream
    /// ends once drained. Connections already delivered are left alone.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Closes the demultiplexer and aborts every connection it has delivered.
    ///
    /// Reads and writes on severed connections fail immediately.
    pub fn sever(&self) {
        self.closed.cancel();
        self.severed.cancel();
    }

    /// Returns `true` if the demultiplexer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

struct Route {
    matcher: Matcher,
    tx: mpsc::Sender<MuxedConnection>,
}

struct DispatchContext {
    tls: Option<TlsAcceptor>,
    sniff_timeout: Duration,
    matchers: Vec<Matcher>,
    routes: Vec<Route>,
    closed: CancellationToken,
    severed: CancellationToken,
}

/// Splits connections accepted on one listener across multiple sub-listeners by protocol.
pub struct Demultiplexer {
    listener: ConnectionOrientedListener,
    tls_config: Option<Arc<ServerConfig>>,
    sniff_timeout: Duration,
    routes: Vec<Route>,
    closed: CancellationToken,
    severed: CancellationToken,
}

impl Demultiplexer {
    /// Creates a new `Demultiplexer` over the given listener, with no routes.
    pub fn new(listener: ConnectionOrientedListener) -> Self {
        Self {
            listener,
            tls_config: None,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            routes: Vec::new(),
            closed: CancellationToken::new(),
            severed: CancellationToken::new(),
        }
    }

    /// Sets the TLS configuration used to terminate TLS on every accepted connection.
    ///
    /// When `None`, connections are sniffed and delivered as plaintext.
    pub fn with_tls_config(mut self, tls_config: Option<Arc<ServerConfig>>) -> Self {
        self.tls_config = tls_config;
        self
    }

    /// Sets the maximum time allowed for a connection to complete its TLS handshake and send enough bytes to be
    /// routed.
    ///
    /// Defaults to 10 seconds.
    pub fn with_sniff_timeout(mut self, sniff_timeout: Duration) -> Self {
        self.sniff_timeout = sniff_timeout;
        self
    }

    /// Registers a new route and returns the sub-listener that receives its connections.
    ///
    /// Routes are evaluated in registration order.
    pub fn route(&mut self, matcher: Matcher) -> SubListener {
        let (tx, rx) = mpsc::channel(SUB_LISTENER_BACKLOG);
        self.routes.push(Route { matcher, tx });

        SubListener {
            route: matcher.name(),
            rx,
        }
    }

    /// Returns a handle that can close or sever the demultiplexer.
    pub fn handle(&self) -> DemuxHandle {
        DemuxHandle {
            closed: self.closed.clone(),
            severed: self.severed.clone(),
        }
    }

    /// Gets a reference to the configured listen address.
    pub fn listen_address(&self) -> &ListenAddress {
        self.listener.listen_address()
    }

    /// Returns the address the underlying listener is bound to.
    ///
    /// ## Errors
    ///
    /// If the local address of the underlying socket cannot be queried, an error is returned.
    pub fn local_addr(&self) -> io::Result<ListenAddress> {
        self.listener.local_addr()
    }

    /// Runs the accept loop.
    ///
    /// Each accepted connection is handed to its own task for the TLS handshake and sniffing, so slow clients never
    /// hold up the accept loop. The listening socket is released when this future completes.
    ///
    /// ## Errors
    ///
    /// Returns [`DemuxError::Closed`] once the demultiplexer is closed through its handle, or [`DemuxError::Accept`]
    /// if the listener fails to accept a connection.
    pub async fn serve(self) -> Result<(), DemuxError> {
        let Self {
            mut listener,
            tls_config,
            sniff_timeout,
            routes,
            closed,
            severed,
        } = self;

        let listen_addr = listener.listen_address().clone();
        let ctx = Arc::new(DispatchContext {
            tls: tls_config.map(TlsAcceptor::from),
            sniff_timeout,
            matchers: routes.iter().map(|route| route.matcher).collect(),
            routes,
            closed: closed.clone(),
            severed,
        });

        debug!(%listen_addr, routes = ctx.routes.len(), tls = ctx.tls.is_some(), "Demultiplexer accepting connections.");

        loop {
            tokio::select! {
                biased;

                _ = closed.cancelled() => {
                    debug!(%listen_addr, "Demultiplexer closed. Releasing listener.");
                    return Err(DemuxError::Closed);
                }
                result = listener.accept() => match result {
                    Ok(conn) => {
                        counter!("minigrpc_connections_accepted_total").increment(1);
                        spawn_traced(dispatch(conn, Arc::clone(&ctx)));
                    }
                    Err(e) => match classify_accept_error(&e) {
                        AcceptFailure::Aborted => {
                            debug!(%listen_addr, error = %e, "Connection aborted before it could be accepted.");
                        }
                        AcceptFailure::Exhausted => {
                            counter!("minigrpc_accept_backoffs_total").increment(1);
                            warn!(
                                %listen_addr,
                                error = %e,
                                backoff = ?ACCEPT_BACKOFF,
                                "Out of resources while accepting connections. Backing off."
                            );

                            // A close during the backoff is picked up at the top of the loop.
                            tokio::select! {
                                _ = closed.cancelled() => {}
                                _ = sleep(ACCEPT_BACKOFF) => {}
                            }
                        }
                        AcceptFailure::Fatal => return Err(e).context(Accept),
                    },
                },
            }
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum AcceptFailure {
    /// The peer went away before its connection was accepted.
    Aborted,

    /// The process or system ran out of file descriptors, socket buffers, or memory.
    Exhausted,

    Fatal,
}

fn classify_accept_error(error: &ListenerError) -> AcceptFailure {
    let Some(io_error) = error.io_error() else {
        return AcceptFailure::Fatal;
    };

    match io_error.kind() {
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => AcceptFailure::Aborted,
        io::ErrorKind::OutOfMemory => AcceptFailure::Exhausted,
        _ if is_resource_exhaustion(io_error) => AcceptFailure::Exhausted,
        _ => AcceptFailure::Fatal,
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_error: &io::Error) -> bool {
    false
}

async fn dispatch(conn: Connection, ctx: Arc<DispatchContext>) {
    let remote_addr = conn.remote_addr();
    let started = Instant::now();

    let sniffed = tokio::select! {
        biased;

        _ = ctx.closed.cancelled() => {
            trace!(%remote_addr, "Demultiplexer closed while sniffing connection. Dropping it.");
            return;
        }
        result = timeout(ctx.sniff_timeout, sniff(conn, remote_addr.clone(), &ctx)) => result,
    };

    let (route_idx, conn) = match sniffed {
        Ok(Ok(routed)) => routed,
        Ok(Err(e)) => {
            counter!("minigrpc_connections_rejected_total", "reason" => e.reason()).increment(1);
            debug!(%remote_addr, error = %e, "Dropping connection.");
            return;
        }
        Err(_) => {
            counter!("minigrpc_connections_rejected_total", "reason" => "sniff_timeout").increment(1);
            debug!(%remote_addr, sniff_timeout = ?ctx.sniff_timeout, "Connection did not identify itself in time. Dropping it.");
            return;
        }
    };

    let route = &ctx.routes[route_idx];
    let route_name = route.matcher.name();

    tokio::select! {
        biased;

        _ = ctx.closed.cancelled() => {
            trace!(%remote_addr, route = route_name, "Demultiplexer closed before connection could be delivered. Dropping it.");
        }
        result = route.tx.send(conn) => match result {
            Ok(()) => {
                counter!("minigrpc_connections_routed_total", "route" => route_name).increment(1);
                trace!(%remote_addr, route = route_name, elapsed = ?started.elapsed(), "Routed connection.");
            }
            Err(_) => {
                debug!(%remote_addr, route = route_name, "Sub-listener is no longer accepting connections. Dropping connection.");
            }
        },
    }
}

async fn sniff(
    conn: Connection, remote_addr: ConnectionAddress, ctx: &DispatchContext,
) -> Result<(usize, MuxedConnection), SniffError> {
    let mut transport = match &ctx.tls {
        Some(acceptor) => Transport::Tls(Box::new(acceptor.accept(conn).await.context(Handshake)?)),
        None => Transport::Plain(conn),
    };

    let mut prefix = BytesMut::with_capacity(MAX_SNIFF_LEN);
    loop {
        let n = transport.read_buf(&mut prefix).await.context(Read)?;
        let complete = n == 0;
        if complete && prefix.is_empty() {
            return Err(SniffError::PeerClosed);
        }

        match select_route(&ctx.matchers, &prefix, complete) {
            Decision::Route(idx) => {
                let conn = MuxedConnection::new(
                    transport,
                    prefix.freeze(),
                    remote_addr,
                    ctx.matchers[idx].name(),
                    ctx.severed.clone().cancelled_owned(),
                );
                return Ok((idx, conn));
            }
            Decision::NeedMore if !complete && prefix.len() < MAX_SNIFF_LEN => {
                prefix.reserve(MAX_SNIFF_LEN);
            }
            Decision::NeedMore | Decision::Unmatched => return Err(SniffError::Unmatched),
        }
    }
}
