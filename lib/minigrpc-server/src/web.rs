//! gRPC-Web support.
//!
//! Browsers cannot speak native gRPC, so gRPC-Web requests are translated into regular gRPC calls before they reach the
//! registered services. Browsers on another origin also need CORS: preflight requests are answered here, and the
//! gRPC status headers are exposed so that client code can read them.
use std::time::Duration;

use http::HeaderName;
use tonic_web::GrpcWebLayer;
use tower::{
    layer::util::{Identity, Stack},
    util::{option_layer, Either},
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_EXPOSED_HEADERS: [&str; 3] = ["grpc-status", "grpc-message", "grpc-status-details-bin"];

/// Layers that make a gRPC server reachable from browsers.
pub type GrpcWebLayers = Stack<GrpcWebLayer, CorsLayer>;

/// Creates the CORS policy for gRPC-Web clients.
///
/// Any origin is allowed, along with whatever method and headers its preflight asks for, and credentials may be sent.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers(DEFAULT_EXPOSED_HEADERS.map(HeaderName::from_static))
        .max_age(DEFAULT_MAX_AGE)
}

/// Creates the gRPC-Web translation layers, with CORS handled before translation.
pub fn grpc_web_layers() -> GrpcWebLayers {
    Stack::new(GrpcWebLayer::new(), cors_layer())
}

/// Returns the gRPC-Web layers if `enabled` is `true`, or a pass-through layer otherwise.
pub fn maybe_grpc_web_layers(enabled: bool) -> Either<GrpcWebLayers, Identity> {
    option_layer(enabled.then(grpc_web_layers))
}
