//! TLS.

use minigrpc_error::GenericError;

/// Initializes the TLS subsystem.
///
/// This installs AWS-LC as the process-wide cryptography provider for `rustls`, so that every TLS configuration built
/// afterwards, including client configurations that don't pick a provider explicitly, agrees on the same one.
///
/// ## Errors
///
/// If the TLS subsystem was already initialized, an error will be returned.
pub fn initialize_tls() -> Result<(), GenericError> {
    minigrpc_tls::initialize_default_crypto_provider()
}
