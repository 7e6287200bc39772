use std::{fmt, time::Duration};

use minigrpc_io::net::ListenAddress;
use minigrpc_tls::{ClientCaPool, SecurityMode, ServerIdentity, TlsSettings};

use crate::registry::ServiceRegistry;

const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// A service registration callback.
///
/// Registration callbacks are applied in order, once, when the server starts. They can only attach services: security
/// and shutdown behavior are fixed by [`ServerConfig`].
pub type RegistrationFn = Box<dyn FnOnce(&mut ServiceRegistry) + Send>;

/// Server configuration.
///
/// Immutable once built. Use [`ServerConfig::builder`] to create one.
pub struct ServerConfig {
    listen_address: ListenAddress,
    stop_grace_period: Duration,
    registrations: Vec<RegistrationFn>,
    tls: Option<TlsSettings>,
    grpc_web: bool,
    sniff_timeout: Duration,
}

impl ServerConfig {
    /// Creates a builder for a server listening on the given address.
    pub fn builder(listen_address: ListenAddress) -> ServerConfigBuilder {
        ServerConfigBuilder::new(listen_address)
    }

    /// Returns the listen address.
    pub fn listen_address(&self) -> &ListenAddress {
        &self.listen_address
    }

    /// Returns how long a graceful stop may take before the server is forcefully stopped.
    pub fn stop_grace_period(&self) -> Duration {
        self.stop_grace_period
    }

    /// Returns the TLS settings, if TLS is enabled.
    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// Returns the transport security mode.
    pub fn security_mode(&self) -> SecurityMode {
        minigrpc_tls::security_mode(self.tls.as_ref())
    }

    /// Returns `true` if gRPC-Web clients are served alongside native gRPC clients.
    pub fn grpc_web(&self) -> bool {
        self.grpc_web
    }

    /// Returns the maximum time a connection may take to identify its protocol.
    pub fn sniff_timeout(&self) -> Duration {
        self.sniff_timeout
    }

    /// Returns the number of registration callbacks.
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub(crate) fn into_parts(self) -> (ServerConfig, Vec<RegistrationFn>) {
        let Self {
            listen_address,
            stop_grace_period,
            registrations,
            tls,
            grpc_web,
            sniff_timeout,
        } = self;

        let config = Self {
            listen_address,
            stop_grace_period,
            registrations: Vec::new(),
            tls,
            grpc_web,
            sniff_timeout,
        };

        (config, registrations)
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_address", &self.listen_address)
            .field("stop_grace_period", &self.stop_grace_period)
            .field("registrations", &self.registrations.len())
            .field("security_mode", &self.security_mode())
            .field("grpc_web", &self.grpc_web)
            .field("sniff_timeout", &self.sniff_timeout)
            .finish()
    }
}

/// Builder for [`ServerConfig`].
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Creates a new `ServerConfigBuilder` for a plaintext server on the given address, with gRPC-Web enabled and the
    /// default grace period of 10 seconds.
    pub fn new(listen_address: ListenAddress) -> Self {
        Self {
            config: ServerConfig {
                listen_address,
                stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
                registrations: Vec::new(),
                tls: None,
                grpc_web: true,
                sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            },
        }
    }

    /// Sets how long a graceful stop may take before the server is forcefully stopped.
    pub fn with_stop_grace_period(mut self, stop_grace_period: Duration) -> Self {
        self.config.stop_grace_period = stop_grace_period;
        self
    }

    /// Adds a registration callback.
    pub fn with_registration<F>(mut self, registration: F) -> Self
    where
        F: FnOnce(&mut ServiceRegistry) + Send + 'static,
    {
        self.config.registrations.push(Box::new(registration));
        self
    }

    /// Adds a batch of boxed registration callbacks.
    pub fn with_registrations<I>(mut self, registrations: I) -> Self
    where
        I: IntoIterator<Item = RegistrationFn>,
    {
        self.config.registrations.extend(registrations);
        self
    }

    /// Enables TLS with the given settings.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Enables TLS with the given server identity, and mutual TLS if a client CA pool is given.
    pub fn with_identity(self, identity: ServerIdentity, client_ca: Option<ClientCaPool>) -> Self {
        let tls = match client_ca {
            Some(client_ca) => TlsSettings::mutual(identity, client_ca),
            None => TlsSettings::server_authenticated(identity),
        };
        self.with_tls(tls)
    }

    /// Sets whether gRPC-Web clients are served alongside native gRPC clients.
    pub fn with_grpc_web(mut self, grpc_web: bool) -> Self {
        self.config.grpc_web = grpc_web;
        self
    }

    /// Sets the maximum time a connection may take to complete its TLS handshake and identify its protocol.
    pub fn with_sniff_timeout(mut self, sniff_timeout: Duration) -> Self {
        self.config.sniff_timeout = sniff_timeout;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use minigrpc_tls::test_util::TestPki;

    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::builder(ListenAddress::any_tcp(9003)).build();

        assert_eq!(config.listen_address(), &ListenAddress::any_tcp(9003));
        assert_eq!(config.stop_grace_period(), Duration::from_secs(10));
        assert_eq!(config.security_mode(), SecurityMode::Plaintext);
        assert!(config.grpc_web());
        assert_eq!(config.registration_count(), 0);
    }

    #[test]
    fn identity_selects_security_mode() {
        let pki = TestPki::generate();

        let tls = ServerConfig::builder(ListenAddress::any_tcp(9003))
            .with_identity(pki.server_identity(), None)
            .build();
        assert_eq!(tls.security_mode(), SecurityMode::ServerAuthenticated);

        let mtls = ServerConfig::builder(ListenAddress::any_tcp(9003))
            .with_identity(pki.server_identity(), Some(pki.client_ca_pool()))
            .build();
        assert_eq!(mtls.security_mode(), SecurityMode::Mutual);
    }

    #[test]
    fn registrations_are_kept_in_order() {
        let config = ServerConfig::builder(ListenAddress::any_tcp(9003))
            .with_registration(|_| {})
            .with_registrations(vec![Box::new(|_: &mut ServiceRegistry| {}) as RegistrationFn])
            .build();
        assert_eq!(config.registration_count(), 2);

        let (config, registrations) = config.into_parts();
        assert_eq!(config.registration_count(), 0);
        assert_eq!(registrations.len(), 2);
    }
}
