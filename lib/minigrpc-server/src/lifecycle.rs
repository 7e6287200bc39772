//! Server lifecycle.
use std::{fmt, future::Future, time::Duration};

use minigrpc_error::{generic_error, ErrorContext as _, GenericError};
use minigrpc_io::net::{
    demux::{DemuxHandle, Demultiplexer, Matcher, SubListener},
    listener::ConnectionOrientedListener,
    ListenAddress,
};
use minigrpc_tls::{build_server_tls_config, ClientCaPool, ServerIdentity};
use tokio::{
    sync::{oneshot, watch},
    task::{JoinError, JoinSet},
    time::timeout,
};
use tonic::{service::Routes, transport::Server};
use tracing::{debug, error, info, warn, Instrument as _};

use crate::{
    config::{RegistrationFn, ServerConfig},
    exit::is_graceful_exit,
    interceptor::RequestLoggingLayer,
    registry::ServiceRegistry,
    web::maybe_grpc_web_layers,
};

type ServingLoopResult = Result<Result<(), GenericError>, JoinError>;

/// Lifecycle state of a [`MinimalGrpcServer`].
///
/// States only ever advance, in declaration order: `Created`, `Running`, `Draining`, and then either `Stopped` or
/// `ForceStopped`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LifecycleState {
    /// The server has been constructed but is not yet serving.
    Created,

    /// The server is accepting connections.
    Running,

    /// A stop was requested. New connections are refused while in-flight requests finish.
    Draining,

    /// Every serving loop finished within the grace period.
    Stopped,

    /// The grace period elapsed and remaining connections were severed.
    ForceStopped,
}

impl LifecycleState {
    /// Returns `true` if the server has finished stopping.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::ForceStopped)
    }

    const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::ForceStopped => "force_stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
struct LifecycleStatus {
    state: LifecycleState,
    local_addr: Option<ListenAddress>,
}

/// Observes the lifecycle of a [`MinimalGrpcServer`] from another task.
#[derive(Clone, Debug)]
pub struct LifecycleWatcher {
    status_rx: watch::Receiver<LifecycleStatus>,
}

impl LifecycleWatcher {
    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.status_rx.borrow().state
    }

    /// Returns the address the server is bound to, once it is running.
    ///
    /// For TCP listen addresses with port 0, this carries the port picked by the operating system.
    pub fn local_addr(&self) -> Option<ListenAddress> {
        self.status_rx.borrow().local_addr.clone()
    }

    /// Waits until the server has reached `target`, or any later state, and returns the state it is in.
    ///
    /// If the server is dropped before reaching `target`, the last observed state is returned.
    pub async fn wait_for_state(&mut self, target: LifecycleState) -> LifecycleState {
        let reached = self
            .status_rx
            .wait_for(|status| status.state >= target)
            .await
            .map(|status| status.state);

        reached.unwrap_or_else(|_| self.status_rx.borrow().state)
    }
}

/// A gRPC server with a managed lifecycle.
///
/// The server binds a single listener, serves every registered service over it (to native gRPC clients and, when
/// enabled, gRPC-Web clients), and shuts down in two phases once stopped: a graceful drain bounded by the configured
/// grace period, followed by a forced stop if the drain does not finish in time.
///
/// The server is single-use: both run methods consume it.
pub struct MinimalGrpcServer {
    config: ServerConfig,
    registrations: Vec<RegistrationFn>,
    status_tx: watch::Sender<LifecycleStatus>,
}

impl MinimalGrpcServer {
    /// Creates a plaintext server listening on all interfaces on the given TCP port.
    pub fn new(port: u16, stop_grace_period: Duration, registrations: Vec<RegistrationFn>) -> Self {
        let config = ServerConfig::builder(ListenAddress::any_tcp(port))
            .with_stop_grace_period(stop_grace_period)
            .with_registrations(registrations)
            .build();

        Self::from_config(config)
    }

    /// Creates a TLS server listening on all interfaces on the given TCP port.
    ///
    /// When `client_ca` is given, clients must present a certificate issued by one of its authorities.
    pub fn new_https(
        port: u16, stop_grace_period: Duration, identity: ServerIdentity, client_ca: Option<ClientCaPool>,
        registrations: Vec<RegistrationFn>,
    ) -> Self {
        let config = ServerConfig::builder(ListenAddress::any_tcp(port))
            .with_stop_grace_period(stop_grace_period)
            .with_identity(identity, client_ca)
            .with_registrations(registrations)
            .build();

        Self::from_config(config)
    }

    /// Creates a server from the given configuration.
    pub fn from_config(config: ServerConfig) -> Self {
        let (config, registrations) = config.into_parts();
        let (status_tx, _) = watch::channel(LifecycleStatus {
            state: LifecycleState::Created,
            local_addr: None,
        });

        Self {
            config,
            registrations,
            status_tx,
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns a watcher for the lifecycle of this server.
    pub fn subscribe(&self) -> LifecycleWatcher {
        LifecycleWatcher {
            status_rx: self.status_tx.subscribe(),
        }
    }

    /// Runs the server until the process receives SIGINT, SIGTERM or SIGQUIT (Ctrl-C on non-Unix platforms).
    ///
    /// ## Errors
    ///
    /// If the signal handlers cannot be installed, or in any of the cases described by
    /// [`run_until_stopped`][Self::run_until_stopped], an error is returned.
    pub async fn run_until_interrupted(self) -> Result<(), GenericError> {
        let interrupted = interrupt_signal()?;
        self.run_until_stopped(interrupted).await
    }

    /// Runs the server until `stopper` completes.
    ///
    /// Any future can be used as the stop trigger. For a `oneshot::Receiver`, dropping the sender also stops the
    /// server. Once triggered, the server stops accepting connections and waits up to the grace period for in-flight
    /// requests to finish, after which all remaining connections are severed.
    ///
    /// The server also stops on its own if one of its serving loops exits unexpectedly, such as when the listener
    /// fails to accept connections.
    ///
    /// ## Errors
    ///
    /// If the listener cannot be created, or if services with conflicting names were registered, an error is returned
    /// before the server starts running. If any serving loop exited with an error that was not caused by the server
    /// stopping, that error is returned after the server has stopped.
    pub async fn run_until_stopped<F>(self, stopper: F) -> Result<(), GenericError>
    where
        F: Future,
    {
        self.start().await?.stop_when(stopper).await
    }

    async fn start(self) -> Result<ActiveServer, GenericError> {
        let Self {
            config,
            registrations,
            status_tx,
        } = self;

        let listen_address = config.listen_address().clone();
        let listener = ConnectionOrientedListener::from_listen_address(listen_address.clone())
            .await
            .with_error_context(|| {
                format!(
                    "Failed to create listener on {}/{}.",
                    listen_address.listener_type(),
                    address_without_scheme(&listen_address)
                )
            })?;

        let mut registry = ServiceRegistry::new();
        for registration in registrations {
            registration(&mut registry);
        }
        if !registry.conflicts().is_empty() {
            return Err(generic_error!(
                "Conflicting gRPC service registrations: {}.",
                registry.conflicts().join(", ")
            ));
        }
        let service_count = registry.len();
        let routes = registry.into_routes();

        let mut demux = Demultiplexer::new(listener)
            .with_tls_config(build_server_tls_config(config.tls()))
            .with_sniff_timeout(config.sniff_timeout());
        let local_addr = demux.local_addr().unwrap_or_else(|_| listen_address.clone());

        let mut sub_listeners = Vec::new();
        if config.grpc_web() {
            sub_listeners.push(demux.route(Matcher::Http1));
        }
        sub_listeners.push(demux.route(Matcher::Any));
        let demux_handle = demux.handle();

        let mut serving_loops = JoinSet::new();
        let mut graceful_stops = Vec::with_capacity(sub_listeners.len());
        for incoming in sub_listeners {
            let (stop_tx, stop_rx) = oneshot::channel();
            graceful_stops.push(stop_tx);
            serving_loops.spawn(serve(routes.clone(), incoming, config.grpc_web(), stop_rx).in_current_span());
        }
        serving_loops.spawn(
            async move {
                demux
                    .serve()
                    .await
                    .error_context("Demultiplexer stopped accepting connections.")
            }
            .in_current_span(),
        );

        status_tx.send_modify(|status| {
            status.state = LifecycleState::Running;
            status.local_addr = Some(local_addr.clone());
        });
        info!(
            listen_addr = %local_addr,
            security = %config.security_mode(),
            grpc_web = config.grpc_web(),
            services = service_count,
            "gRPC server running."
        );

        Ok(ActiveServer {
            grace_period: config.stop_grace_period(),
            status_tx,
            serving_loops,
            graceful_stops,
            demux_handle,
        })
    }
}

/// A server whose serving loops are running.
struct ActiveServer {
    grace_period: Duration,
    status_tx: watch::Sender<LifecycleStatus>,
    serving_loops: JoinSet<Result<(), GenericError>>,
    graceful_stops: Vec<oneshot::Sender<()>>,
    demux_handle: DemuxHandle,
}

impl ActiveServer {
    async fn stop_when<F>(self, stopper: F) -> Result<(), GenericError>
    where
        F: Future,
    {
        let Self {
            grace_period,
            status_tx,
            mut serving_loops,
            graceful_stops,
            demux_handle,
        } = self;

        let mut exits = Vec::new();
        tokio::select! {
            _ = stopper => debug!("Stop requested. Draining gRPC server."),
            Some(result) = serving_loops.join_next() => {
                warn!("gRPC serving loop exited unexpectedly. Draining gRPC server.");
                exits.push(flatten_exit(result));
            }
        }

        set_state(&status_tx, LifecycleState::Draining);
        for stop_tx in graceful_stops {
            let _ = stop_tx.send(());
        }
        demux_handle.close();

        let final_state = match timeout(grace_period, drain(&mut serving_loops, &mut exits)).await {
            Ok(()) => {
                debug!("gRPC server stopped gracefully.");
                LifecycleState::Stopped
            }
            Err(_) => {
                warn!(
                    "gRPC server failed to stop gracefully after {:?}; hard-stopping now...",
                    grace_period
                );
                demux_handle.sever();
                serving_loops.abort_all();
                drain(&mut serving_loops, &mut exits).await;

                debug!("gRPC server hard-stopped.");
                LifecycleState::ForceStopped
            }
        };
        set_state(&status_tx, final_state);

        into_run_result(exits)
    }
}

/// Reduces the exits of every serving loop to the result of the run.
///
/// The first exit that was not caused by the server stopping wins.
fn into_run_result(exits: Vec<Option<GenericError>>) -> Result<(), GenericError> {
    match exits.into_iter().flatten().find(|e| !is_graceful_exit(Some(e))) {
        Some(e) => {
            error!(error = %e, "gRPC server exited with an error.");
            Err(e.context("gRPC server returned an error after it was done serving."))
        }
        None => Ok(()),
    }
}

async fn serve(
    routes: Routes, incoming: SubListener, grpc_web: bool, stop_rx: oneshot::Receiver<()>,
) -> Result<(), GenericError> {
    let route = incoming.route();
    let accept_http1 = route == Matcher::Http1.name();

    debug!(route, accept_http1, "gRPC serving loop started.");

    Server::builder()
        .accept_http1(accept_http1)
        .layer(maybe_grpc_web_layers(grpc_web))
        .layer(RequestLoggingLayer::new())
        .add_routes(routes)
        .serve_with_incoming_shutdown(incoming, async move {
            // A dropped sender means the controller is gone, which is a stop as well.
            let _ = stop_rx.await;
        })
        .await
        .with_error_context(|| format!("gRPC serving loop for route '{}' failed.", route))
}

async fn drain(serving_loops: &mut JoinSet<Result<(), GenericError>>, exits: &mut Vec<Option<GenericError>>) {
    while let Some(result) = serving_loops.join_next().await {
        exits.push(flatten_exit(result));
    }
}

fn flatten_exit(result: ServingLoopResult) -> Option<GenericError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(e.into()),
    }
}

fn set_state(status_tx: &watch::Sender<LifecycleStatus>, state: LifecycleState) {
    status_tx.send_if_modified(|status| {
        if state > status.state {
            status.state = state;
            true
        } else {
            false
        }
    });
}

fn address_without_scheme(address: &ListenAddress) -> String {
    let address = address.to_string();
    match address.split_once("://") {
        Some((_, rest)) => rest.to_string(),
        None => address,
    }
}

#[cfg(unix)]
fn interrupt_signal() -> Result<impl Future<Output = ()>, GenericError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
    let mut sigterm = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;
    let mut sigquit = signal(SignalKind::quit()).error_context("Failed to set up SIGQUIT handler.")?;

    Ok(async move {
        let signal = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };
        info!(signal, "Received signal. Stopping gRPC server.");
    })
}

#[cfg(not(unix))]
fn interrupt_signal() -> Result<impl Future<Output = ()>, GenericError> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C. Stopping gRPC server."),
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl-C. Server must be stopped externally.");
                std::future::pending::<()>().await
            }
        }
    })
}
