//! Certificate generation helpers for tests.
//!
//! Generates a throwaway certificate authority which can then issue server and client certificates, along with the
//! matching `rustls` client configurations needed to connect to a server using them.

use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
    ClientConfig, RootCertStore,
};

use crate::{ClientCaPool, ServerIdentity};

struct Issued {
    cert: Certificate,
    key: KeyPair,
}

impl Issued {
    fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der()))
    }
}

/// A test public key infrastructure: one CA, one server certificate for `localhost`, and one client certificate.
pub struct TestPki {
    ca: Issued,
    server: Issued,
    client: Issued,
}

impl TestPki {
    /// Generates a fresh CA and issues a server and a client certificate from it.
    ///
    /// # Panics
    ///
    /// Panics if certificate generation fails.
    pub fn generate() -> Self {
        let ca = generate_ca("minigrpc test CA");
        let server = issue(
            &ca,
            vec!["localhost".to_string(), "127.0.0.1".to_string()],
            ExtendedKeyUsagePurpose::ServerAuth,
        );
        let client = issue(&ca, vec!["client".to_string()], ExtendedKeyUsagePurpose::ClientAuth);

        Self { ca, server, client }
    }

    /// Returns the CA certificate, PEM-encoded.
    pub fn ca_pem(&self) -> String {
        self.ca.cert.pem()
    }

    /// Returns the server certificate and private key, PEM-encoded.
    pub fn server_pem(&self) -> (String, String) {
        (self.server.cert.pem(), self.server.key.serialize_pem())
    }

    /// Returns the client certificate and private key, PEM-encoded.
    pub fn client_pem(&self) -> (String, String) {
        (self.client.cert.pem(), self.client.key.serialize_pem())
    }

    /// Returns the server identity.
    pub fn server_identity(&self) -> ServerIdentity {
        ServerIdentity::from_der(vec![self.server.cert_der()], self.server.key_der())
            .expect("generated server identity should be valid")
    }

    /// Returns a client CA pool containing only this PKI's CA.
    pub fn client_ca_pool(&self) -> ClientCaPool {
        ClientCaPool::from_pem(self.ca_pem().as_bytes()).expect("generated CA should be valid")
    }

    /// Returns a client configuration that trusts this PKI's CA and presents no client certificate.
    pub fn anonymous_client_config(&self) -> Arc<ClientConfig> {
        let config = ClientConfig::builder()
            .with_root_certificates(self.root_store())
            .with_no_client_auth();

        Arc::new(config)
    }

    /// Returns a client configuration that trusts this PKI's CA and presents the client certificate.
    pub fn authenticated_client_config(&self) -> Arc<ClientConfig> {
        let config = ClientConfig::builder()
            .with_root_certificates(self.root_store())
            .with_client_auth_cert(vec![self.client.cert_der()], self.client.key_der())
            .expect("generated client certificate should be valid");

        Arc::new(config)
    }

    /// Returns a client configuration that presents a certificate issued by a different, untrusted, CA.
    pub fn untrusted_client_config(&self) -> Arc<ClientConfig> {
        let rogue_ca = generate_ca("rogue CA");
        let rogue_client = issue(&rogue_ca, vec!["rogue".to_string()], ExtendedKeyUsagePurpose::ClientAuth);

        let config = ClientConfig::builder()
            .with_root_certificates(self.root_store())
            .with_client_auth_cert(vec![rogue_client.cert_der()], rogue_client.key_der())
            .expect("generated client certificate should be valid");

        Arc::new(config)
    }

    /// Returns the server name clients should use when connecting.
    pub fn server_name(&self) -> ServerName<'static> {
        ServerName::try_from("localhost").expect("localhost is a valid server name")
    }

    fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.cert_der()).expect("generated CA should be a valid trust anchor");
        roots
    }
}

fn generate_ca(common_name: &str) -> Issued {
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("empty SAN list should be valid");
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key = KeyPair::generate().expect("should generate CA key pair");
    let cert = params.self_signed(&key).expect("should self-sign CA certificate");

    Issued { cert, key }
}

fn issue(issuer: &Issued, subject_alt_names: Vec<String>, usage: ExtendedKeyUsagePurpose) -> Issued {
    let mut params = CertificateParams::new(subject_alt_names).expect("SANs should be valid");
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![usage];

    let key = KeyPair::generate().expect("should generate leaf key pair");
    let cert = params
        .signed_by(&key, &issuer.cert, &issuer.key)
        .expect("should sign leaf certificate");

    Issued { cert, key }
}
