use std::convert::Infallible;

use tonic::{
    body::Body,
    server::NamedService,
    service::{Routes, RoutesBuilder},
};
use tower::Service;
use tracing::{debug, warn};

/// The route registry that registration callbacks attach services to.
///
/// Each service is routed by its fully-qualified gRPC service name (`/<package>.<Service>/<Method>`). Registering two
/// services with the same name is a conflict: the first registration is kept, the later one is dropped, and the server
/// refuses to start.
pub struct ServiceRegistry {
    builder: RoutesBuilder,
    service_names: Vec<&'static str>,
    conflicts: Vec<&'static str>,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            builder: RoutesBuilder::default(),
            service_names: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Adds a service to the registry.
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: Service<http::Request<Body>, Error = Infallible> + NamedService + Clone + Send + Sync + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        if self.service_names.contains(&S::NAME) {
            warn!(service = S::NAME, "Service registered more than once. Ignoring duplicate registration.");
            self.conflicts.push(S::NAME);
            return self;
        }

        debug!(service = S::NAME, "Registered service.");
        self.service_names.push(S::NAME);
        self.builder.add_service(service);
        self
    }

    /// Returns the names of the registered services, in registration order.
    pub fn service_names(&self) -> &[&'static str] {
        &self.service_names
    }

    /// Returns the number of registered services.
    pub fn len(&self) -> usize {
        self.service_names.len()
    }

    /// Returns `true` if no services have been registered.
    pub fn is_empty(&self) -> bool {
        self.service_names.is_empty()
    }

    /// Returns the names of services that were registered more than once.
    pub(crate) fn conflicts(&self) -> &[&'static str] {
        &self.conflicts
    }

    pub(crate) fn into_routes(self) -> Routes {
        self.builder.routes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EchoService;

    #[test]
    fn services_are_recorded_in_order() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.is_empty());

        registry.add_service(EchoService::default());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.service_names(), &[EchoService::NAME]);
        assert!(registry.conflicts().is_empty());
    }

    #[test]
    fn duplicate_services_are_flagged() {
        let mut registry = ServiceRegistry::new();
        registry
            .add_service(EchoService::default())
            .add_service(EchoService::default());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.conflicts(), &[EchoService::NAME]);
    }
}
