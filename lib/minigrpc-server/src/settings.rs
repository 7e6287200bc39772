//! Process-level server settings.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use minigrpc_error::{generic_error, ErrorContext as _, GenericError};
use minigrpc_io::net::ListenAddress;
use minigrpc_tls::{ClientCaPool, ServerIdentity, TlsSettings};
use serde::Deserialize;

use crate::config::ServerConfigBuilder;

const fn default_listen_address() -> ListenAddress {
    ListenAddress::any_tcp(9003)
}

const fn default_stop_grace_period_secs() -> u64 {
    10
}

const fn default_sniff_timeout_secs() -> u64 {
    10
}

const fn default_grpc_web_enabled() -> bool {
    true
}

/// Server settings, in a form that can be loaded from configuration files and environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on.
    ///
    /// Defaults to `tcp://0.0.0.0:9003`.
    #[serde(default = "default_listen_address")]
    pub listen_address: ListenAddress,

    /// Seconds to wait for in-flight requests to finish when stopping, before connections are severed.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_stop_grace_period_secs")]
    pub stop_grace_period_secs: u64,

    /// Seconds a new connection has to complete its TLS handshake and identify its protocol.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_sniff_timeout_secs")]
    pub sniff_timeout_secs: u64,

    /// Whether gRPC-Web clients are served.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_grpc_web_enabled")]
    pub grpc_web_enabled: bool,

    /// Path to the PEM-encoded server certificate chain.
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,

    /// Path to the PEM-encoded server private key.
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    /// Path to the PEM-encoded certificate authorities trusted to issue client certificates.
    ///
    /// Setting this enables mutual TLS, and requires `tls_cert_file` and `tls_key_file` to be set as well.
    #[serde(default)]
    pub tls_client_ca_file: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            stop_grace_period_secs: default_stop_grace_period_secs(),
            sniff_timeout_secs: default_sniff_timeout_secs(),
            grpc_web_enabled: default_grpc_web_enabled(),
            tls_cert_file: None,
            tls_key_file: None,
            tls_client_ca_file: None,
        }
    }
}

impl ServerSettings {
    /// Loads the TLS settings described by these settings, if any.
    ///
    /// ## Errors
    ///
    /// If only one of the certificate and key files is set, if a client CA file is set without them, or if any of the
    /// files cannot be read or parsed, an error is returned.
    pub fn tls_settings(&self) -> Result<Option<TlsSettings>, GenericError> {
        let (cert_file, key_file) = match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert_file), Some(key_file)) => (cert_file, key_file),
            (None, None) => {
                if self.tls_client_ca_file.is_some() {
                    return Err(generic_error!(
                        "Client CA file configured without a server certificate. Set `tls_cert_file` and `tls_key_file` to enable mutual TLS."
                    ));
                }
                return Ok(None);
            }
            _ => {
                return Err(generic_error!(
                    "Both `tls_cert_file` and `tls_key_file` must be set to enable TLS."
                ))
            }
        };

        let cert_pem = read_pem(cert_file)?;
        let key_pem = read_pem(key_file)?;
        let identity = ServerIdentity::from_pem(&cert_pem, &key_pem).with_error_context(|| {
            format!(
                "Failed to load server identity from '{}' and '{}'.",
                cert_file.display(),
                key_file.display()
            )
        })?;

        match &self.tls_client_ca_file {
            Some(ca_file) => {
                let ca_pem = read_pem(ca_file)?;
                let client_ca = ClientCaPool::from_pem(&ca_pem)
                    .with_error_context(|| format!("Failed to load client CA pool from '{}'.", ca_file.display()))?;
                Ok(Some(TlsSettings::mutual(identity, client_ca)))
            }
            None => Ok(Some(TlsSettings::server_authenticated(identity))),
        }
    }

    /// Creates a server configuration builder from these settings.
    ///
    /// ## Errors
    ///
    /// If the TLS settings cannot be loaded, an error is returned.
    pub fn into_builder(self) -> Result<ServerConfigBuilder, GenericError> {
        let tls = self.tls_settings()?;

        let mut builder = ServerConfigBuilder::new(self.listen_address)
            .with_stop_grace_period(Duration::from_secs(self.stop_grace_period_secs))
            .with_sniff_timeout(Duration::from_secs(self.sniff_timeout_secs))
            .with_grpc_web(self.grpc_web_enabled);
        if let Some(tls) = tls {
            builder = builder.with_tls(tls);
        }

        Ok(builder)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, GenericError> {
    std::fs::read(path).with_error_context(|| format!("Failed to read '{}'.", path.display()))
}
