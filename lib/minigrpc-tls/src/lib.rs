//! Transport Layer Security (TLS) configuration for gRPC servers.
//!
//! Servers run in one of three security modes, chosen purely by which certificate material is supplied:
//!
//! - no [`TlsSettings`]: plaintext
//! - [`TlsSettings`] without a client CA pool: server-authenticated TLS
//! - [`TlsSettings`] with a client CA pool: mutual TLS
//!
//! A client CA pool can only be attached to settings that already carry a server identity, so no other combination can
//! be constructed.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{
    fmt,
    io::{self, BufReader},
    sync::{Arc, OnceLock},
};

use minigrpc_error::{generic_error, GenericError};
use rustls::{
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{danger::ClientCertVerifier, ClientHello, ResolvesServerCert, VerifierBuilderError, WebPkiClientVerifier},
    sign::CertifiedKey,
    InconsistentKeys, RootCertStore, ServerConfig,
};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

/// Tracks if the default cryptography provider for `rustls` has been set.
static DEFAULT_CRYPTO_PROVIDER_SET: OnceLock<()> = OnceLock::new();

/// ALPN protocols advertised by TLS-enabled servers, in order of preference.
const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// A TLS material error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TlsError {
    /// PEM data could not be decoded.
    #[snafu(display("failed to decode PEM-encoded {}: {}", what, source))]
    InvalidPem {
        /// Kind of material being decoded.
        what: &'static str,

        /// Source of the error.
        source: io::Error,
    },

    /// No certificates were found in the given PEM data.
    #[snafu(display("no certificates found in PEM-encoded {}", what))]
    NoCertificates {
        /// Kind of material being decoded.
        what: &'static str,
    },

    /// No private key was found in the given PEM data.
    #[snafu(display("no private key found in PEM-encoded private key"))]
    NoPrivateKey,

    /// The private key could not be loaded for signing.
    #[snafu(display("unsupported or invalid private key: {}", source))]
    UnsupportedPrivateKey {
        /// Source of the error.
        source: rustls::Error,
    },

    /// A client CA certificate could not be added to the trust store.
    #[snafu(display("invalid client CA certificate: {}", source))]
    InvalidCaCertificate {
        /// Source of the error.
        source: rustls::Error,
    },

    /// The private key does not belong to the leaf certificate.
    #[snafu(display("private key does not match the leaf certificate: {}", source))]
    MismatchedPrivateKey {
        /// Source of the error.
        source: rustls::Error,
    },

    /// The client certificate verifier could not be built.
    #[snafu(display("failed to build client certificate verifier: {}", source))]
    ClientVerifier {
        /// Source of the error.
        source: VerifierBuilderError,
    },
}

/// The certificate chain and private key a server presents to its clients.
#[derive(Clone)]
pub struct ServerIdentity {
    certified_key: Arc<CertifiedKey>,
}

impl ServerIdentity {
    /// Creates a `ServerIdentity` from a PEM-encoded certificate chain and a PEM-encoded private key.
    ///
    /// The certificate chain must start with the server's own (leaf) certificate. PKCS#1, PKCS#8 and SEC1 private keys
    /// are accepted.
    ///
    /// ## Errors
    ///
    /// If either input is not valid PEM, if no certificate or key is present, if the key is not supported by the
    /// cryptography provider, or if the key does not belong to the leaf certificate, an error is returned.
    pub fn from_pem(cert_chain_pem: &[u8], private_key_pem: &[u8]) -> Result<Self, TlsError> {
        let cert_chain = decode_certificates(cert_chain_pem, "certificate chain")?;
        let private_key = rustls_pemfile::private_key(&mut BufReader::new(private_key_pem))
            .context(InvalidPem { what: "private key" })?
            .ok_or(TlsError::NoPrivateKey)?;

        Self::from_der(cert_chain, private_key)
    }

    /// Creates a `ServerIdentity` from a DER-encoded certificate chain and private key.
    ///
    /// ## Errors
    ///
    /// If the chain is empty, if the key is not supported by the cryptography provider, or if the key does not belong to
    /// the leaf certificate, an error is returned.
    pub fn from_der(
        cert_chain: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        if cert_chain.is_empty() {
            return Err(TlsError::NoCertificates {
                what: "certificate chain",
            });
        }

        let signing_key = current_provider()
            .key_provider
            .load_private_key(private_key)
            .context(UnsupportedPrivateKey)?;

        let certified_key = CertifiedKey::new(cert_chain, signing_key);
        match certified_key.keys_match() {
            // Some signing keys cannot report their public key, so there is nothing to compare against.
            Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
            Err(e) => return Err(e).context(MismatchedPrivateKey),
        }

        Ok(Self {
            certified_key: Arc::new(certified_key),
        })
    }

    /// Returns the number of certificates in the chain presented to clients.
    pub fn chain_len(&self) -> usize {
        self.certified_key.cert.len()
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("chain_len", &self.chain_len())
            .finish_non_exhaustive()
    }
}

/// A set of certificate authorities trusted to issue client certificates.
#[derive(Clone)]
pub struct ClientCaPool {
    verifier: Arc<dyn ClientCertVerifier>,
    authorities: usize,
}

impl ClientCaPool {
    /// Creates a `ClientCaPool` from one or more PEM-encoded CA certificates.
    ///
    /// ## Errors
    ///
    /// If the input is not valid PEM, contains no certificates, or contains a certificate that cannot be used as a
    /// trust anchor, an error is returned.
    pub fn from_pem(ca_pem: &[u8]) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in decode_certificates(ca_pem, "client CA bundle")? {
            roots.add(cert).context(InvalidCaCertificate)?;
        }

        Self::from_root_store(roots)
    }

    /// Creates a `ClientCaPool` from an existing root certificate store.
    ///
    /// ## Errors
    ///
    /// If the store is empty, an error is returned.
    pub fn from_root_store(roots: RootCertStore) -> Result<Self, TlsError> {
        let authorities = roots.len();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), current_provider())
            .build()
            .context(ClientVerifier)?;

        Ok(Self { verifier, authorities })
    }

    /// Returns the number of trusted certificate authorities.
    pub fn len(&self) -> usize {
        self.authorities
    }

    /// Returns `true` if the pool contains no authorities.
    ///
    /// A successfully constructed pool is never empty.
    pub fn is_empty(&self) -> bool {
        self.authorities == 0
    }
}

impl fmt::Debug for ClientCaPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCaPool")
            .field("authorities", &self.authorities)
            .finish_non_exhaustive()
    }
}

/// The transport security mode a server runs in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityMode {
    /// No transport security.
    Plaintext,

    /// One-way TLS: the server presents a certificate, clients are not authenticated.
    ServerAuthenticated,

    /// Two-way TLS: clients must present a certificate issued by a trusted authority.
    Mutual,
}

impl SecurityMode {
    /// Returns a short, human-readable name for the mode.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::ServerAuthenticated => "tls",
            Self::Mutual => "mtls",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate material for a TLS-enabled server.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    identity: ServerIdentity,
    client_ca: Option<ClientCaPool>,
}

impl TlsSettings {
    /// Creates settings for server-authenticated (one-way) TLS.
    pub fn server_authenticated(identity: ServerIdentity) -> Self {
        Self {
            identity,
            client_ca: None,
        }
    }

    /// Creates settings for mutual TLS, where clients must present a certificate issued by an authority in `client_ca`.
    pub fn mutual(identity: ServerIdentity, client_ca: ClientCaPool) -> Self {
        Self {
            identity,
            client_ca: Some(client_ca),
        }
    }

    /// Returns the security mode these settings produce.
    pub fn mode(&self) -> SecurityMode {
        if self.client_ca.is_some() {
            SecurityMode::Mutual
        } else {
            SecurityMode::ServerAuthenticated
        }
    }
}

/// Returns the security mode for the given, optional, TLS settings.
pub fn security_mode(settings: Option<&TlsSettings>) -> SecurityMode {
    settings.map(TlsSettings::mode).unwrap_or(SecurityMode::Plaintext)
}

/// Builds the server-side TLS configuration for the given, optional, TLS settings.
///
/// Returns `None` when no settings are given, meaning the server runs in plaintext. Otherwise, the resulting
/// configuration presents the configured identity and, when a client CA pool is present, requires and verifies client
/// certificates against it. Clients failing verification are rejected during the handshake.
///
/// Both `h2` and `http/1.1` are advertised via ALPN so native gRPC and gRPC-Web clients can both negotiate.
pub fn build_server_tls_config(settings: Option<&TlsSettings>) -> Option<Arc<ServerConfig>> {
    let settings = settings?;

    let builder = ServerConfig::builder_with_provider(current_provider())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        // The provider either comes from the process-wide default or is AWS-LC itself, both of which support the
        // default protocol versions.
        .expect("default protocol versions should always be supported by the cryptography provider");

    let builder = match &settings.client_ca {
        None => builder.with_no_client_auth(),
        Some(client_ca) => builder.with_client_cert_verifier(Arc::clone(&client_ca.verifier)),
    };

    let mut config = builder.with_cert_resolver(Arc::new(StaticCertResolver(Arc::clone(
        &settings.identity.certified_key,
    ))));
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|proto| proto.to_vec()).collect();

    debug!(mode = %settings.mode(), "Built server TLS configuration.");

    Some(Arc::new(config))
}

/// Initializes the default TLS cryptography provider used by `rustls`.
///
/// This explicitly sets the [AWS-LC][aws_lc] provider as the process-wide default provider for all future TLS
/// configurations.
///
/// ## Errors
///
/// If the default cryptography provider has already been set, an error will be returned.
///
/// [aws_lc]: https://github.com/aws/aws-lc-rs
pub fn initialize_default_crypto_provider() -> Result<(), GenericError> {
    if DEFAULT_CRYPTO_PROVIDER_SET.get().is_some() {
        return Err(generic_error!("Default TLS cryptography provider already initialized."));
    }

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| generic_error!("Failed to install AWS-LC as default cryptography provider. This is likely due to a conflicting provider already being installed."))?;

    let _ = DEFAULT_CRYPTO_PROVIDER_SET.set(());

    Ok(())
}

/// Returns the process-wide default cryptography provider, falling back to AWS-LC if none has been installed.
fn current_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .map(Arc::clone)
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn decode_certificates(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context(InvalidPem { what })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates { what });
    }

    Ok(certs)
}

/// Always resolves to the same certificate, regardless of SNI.
#[derive(Debug)]
struct StaticCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::{test_util::TestPki, *};

    #[test]
    fn no_settings_means_plaintext() {
        assert!(build_server_tls_config(None).is_none());
        assert_eq!(security_mode(None), SecurityMode::Plaintext);
    }

    #[test]
    fn identity_without_pool_is_server_authenticated() {
        let pki = TestPki::generate();
        let settings = TlsSettings::server_authenticated(pki.server_identity());

        assert_eq!(settings.mode(), SecurityMode::ServerAuthenticated);

        let config = build_server_tls_config(Some(&settings)).expect("TLS config should be built");
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn identity_with_pool_is_mutual() {
        let pki = TestPki::generate();
        let settings = TlsSettings::mutual(pki.server_identity(), pki.client_ca_pool());

        assert_eq!(security_mode(Some(&settings)), SecurityMode::Mutual);
        assert!(build_server_tls_config(Some(&settings)).is_some());
    }

    #[test]
    fn identity_from_pem() {
        let pki = TestPki::generate();
        let (cert_pem, key_pem) = pki.server_pem();

        let identity = ServerIdentity::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        assert_eq!(identity.chain_len(), 1);
    }

    #[test]
    fn identity_requires_certificate() {
        let pki = TestPki::generate();
        let (_, key_pem) = pki.server_pem();

        let error = ServerIdentity::from_pem(b"", key_pem.as_bytes()).unwrap_err();
        assert!(matches!(error, TlsError::NoCertificates { .. }));
    }

    #[test]
    fn identity_requires_private_key() {
        let pki = TestPki::generate();
        let (cert_pem, _) = pki.server_pem();

        let error = ServerIdentity::from_pem(cert_pem.as_bytes(), cert_pem.as_bytes()).unwrap_err();
        assert!(matches!(error, TlsError::NoPrivateKey));
    }

    #[test]
    fn identity_rejects_key_for_another_certificate() {
        let pki = TestPki::generate();
        let (server_cert_pem, _) = pki.server_pem();
        let (_, client_key_pem) = pki.client_pem();

        let error = ServerIdentity::from_pem(server_cert_pem.as_bytes(), client_key_pem.as_bytes()).unwrap_err();
        assert!(matches!(
            error,
            TlsError::MismatchedPrivateKey {
                source: rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)
            }
        ));
    }

    #[test]
    fn client_ca_pool_from_pem() {
        let pki = TestPki::generate();

        let pool = ClientCaPool::from_pem(pki.ca_pem().as_bytes()).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(!pool.is_empty());
    }

    #[test]
    fn client_ca_pool_rejects_empty_bundle() {
        let error = ClientCaPool::from_pem(b"").unwrap_err();
        assert!(matches!(error, TlsError::NoCertificates { .. }));

        let error = ClientCaPool::from_root_store(RootCertStore::empty()).unwrap_err();
        assert!(matches!(error, TlsError::ClientVerifier { .. }));
    }
}
