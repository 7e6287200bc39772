//! A gRPC server with a managed lifecycle.
//!
//! [`MinimalGrpcServer`] serves native gRPC and gRPC-Web clients on a single listener, optionally behind TLS or mutual
//! TLS, and stops in two phases: a graceful drain bounded by a grace period, then a forced stop.
//!
//! Services are attached through registration callbacks, which receive a [`ServiceRegistry`] when the server starts:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use minigrpc_server::{MinimalGrpcServer, RegistrationFn, ServiceRegistry};
//!
//! # async fn run() -> Result<(), minigrpc_error::GenericError> {
//! let registrations: Vec<RegistrationFn> = vec![Box::new(|registry: &mut ServiceRegistry| {
//!     // Attach tonic-generated services here, such as `registry.add_service(GreeterServer::new(greeter))`.
//!     assert!(registry.is_empty());
//! })];
//!
//! let server = MinimalGrpcServer::new(9003, Duration::from_secs(10), registrations);
//! server.run_until_interrupted().await
//! # }
//! ```
#![deny(warnings)]
#![deny(missing_docs)]

mod config;
pub use self::config::{RegistrationFn, ServerConfig, ServerConfigBuilder};

pub mod exit;

mod interceptor;
pub use self::interceptor::{RequestLogging, RequestLoggingLayer, ResponseFuture};

mod lifecycle;
pub use self::lifecycle::{LifecycleState, LifecycleWatcher, MinimalGrpcServer};

mod registry;
pub use self::registry::ServiceRegistry;

mod settings;
pub use self::settings::ServerSettings;

pub mod web;

#[cfg(test)]
mod test_support;
