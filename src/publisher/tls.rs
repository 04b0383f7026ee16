//! TLS client setup for the remote link
//!
//! Loads the CA bundle and the optional client certificate from PEM files and
//! builds the rustls client configuration handed to rumqttc.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rumqttc::tokio_rustls::rustls::pki_types::pem::PemObject;
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::config::AuthConfig;

/// Error type for TLS setup
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    let file = File::open(path).map_err(|e| {
        TlsError::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })?;
    Ok(BufReader::new(file))
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let reader = open(path)?;
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let reader = open(path)?;

    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e)))
}

/// Root store from a CA bundle, or the platform's trust store
fn load_roots(ca_path: Option<&Path>) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();

    match ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                root_store.add(cert).map_err(|e| {
                    TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
                })?;
            }
            debug!(path = %path.display(), count = root_store.len(), "Loaded CA bundle");
        }
        None => {
            let native = rustls_native_certs::load_native_certs()?;
            let (added, ignored) = root_store.add_parsable_certificates(native);
            if ignored > 0 {
                debug!(ignored, "Skipped unparsable native root certificates");
            }
            if added == 0 {
                warn!("No native root certificates found; server verification will fail");
            }
        }
    }

    Ok(root_store)
}

/// Build the TLS client configuration for the remote link.
///
/// Server certificates are always verified. In certificate mode the client
/// certificate and key are presented during the handshake.
pub fn client_config(auth: &AuthConfig, ca_path: Option<&Path>) -> Result<ClientConfig, TlsError> {
    let roots = load_roots(ca_path)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    match auth {
        AuthConfig::SasToken { .. } => Ok(builder.with_no_client_auth()),
        AuthConfig::Certificate {
            cert_path,
            key_path,
            ..
        } => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::ConfigError(format!("Failed to build TLS config: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn sas() -> AuthConfig {
        AuthConfig::SasToken {
            username: "proxy-client".to_string(),
            password: "token".to_string(),
        }
    }

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::CertificateError("test error".to_string());
        assert_eq!(err.to_string(), "Certificate error: test error");

        let err = TlsError::PrivateKeyError("bad key".to_string());
        assert_eq!(err.to_string(), "Private key error: bad key");
    }

    #[test]
    fn test_missing_ca_file_names_path() {
        let err = client_config(&sas(), Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
        assert!(matches!(err, TlsError::Io(_)));
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let err = client_config(&sas(), Some(file.path())).unwrap_err();
        assert!(matches!(err, TlsError::CertificateError(_)));
    }
}
