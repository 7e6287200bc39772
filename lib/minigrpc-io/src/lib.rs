//! Networking primitives for gRPC servers: listen addresses, connection-oriented listeners, and a protocol
//! demultiplexer for sharing one listening socket between native gRPC and gRPC-Web clients.
#![deny(warnings)]
#![deny(missing_docs)]

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument as _;

pub mod net;

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// This function is a thin wrapper over [`tokio::spawn`], and provides implicit "tracing" for spawned futures by
/// ensuring that the task is attached to the current `tracing` span.
pub fn spawn_traced<F, R>(f: F) -> JoinHandle<R>
where
    F: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    tokio::spawn(f.in_current_span())
}
