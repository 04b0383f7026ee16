//! Remote Broker Configuration
//!
//! Connection settings and credentials for the cloud broker. Credentials are
//! given as loose optional fields (so they map onto environment variables)
//! and resolved once into an [`AuthConfig`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Authentication mode for the remote broker. Exactly one per deployment.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthConfig {
    /// Username plus a pre-issued signed access token used as the password
    SasToken { username: String, password: String },
    /// Mutual TLS with a client certificate
    Certificate {
        cert_path: PathBuf,
        key_path: PathBuf,
        ca_path: Option<PathBuf>,
    },
}

impl AuthConfig {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::SasToken { .. } => "sas-token",
            AuthConfig::Certificate { .. } => "certificate",
        }
    }
}

// Keeps the token out of logs
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::SasToken { username, .. } => f
                .debug_struct("SasToken")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AuthConfig::Certificate {
                cert_path,
                key_path,
                ca_path,
            } => f
                .debug_struct("Certificate")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .field("ca_path", ca_path)
                .finish(),
        }
    }
}

/// Remote broker connection
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    /// TLS port
    pub port: u16,
    /// Publish topic, no wildcards
    pub topic: String,
    /// Must be registered with the remote service beforehand
    pub client_id: String,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client certificate (PEM)
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM)
    pub key_file: Option<PathBuf>,
    /// CA bundle for server verification (PEM). Native roots when unset.
    pub ca_file: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            topic: "sensor/data".to_string(),
            client_id: "mqtt-proxy".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_interval: Duration::from_secs(60),
            username: None,
            password: None,
            cert_file: None,
            key_file: None,
            ca_file: None,
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("max_reconnect_interval", &self.max_reconnect_interval)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("ca_file", &self.ca_file)
            .finish()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn non_blank_path(value: &Option<PathBuf>) -> Option<&Path> {
    value
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
}

impl RemoteConfig {
    /// CA bundle path, if one is configured
    pub fn ca_file(&self) -> Option<&Path> {
        non_blank_path(&self.ca_file)
    }

    /// Resolve the credential fields into a single authentication mode.
    ///
    /// Returns `Ok(None)` when no credentials are set at all. Both families
    /// set, or one family only half set, is an error.
    pub fn auth(&self) -> Result<Option<AuthConfig>, ConfigError> {
        let username = non_blank(&self.username);
        let password = non_blank(&self.password);
        let cert = non_blank_path(&self.cert_file);
        let key = non_blank_path(&self.key_file);

        let sas_given = username.is_some() || password.is_some();
        let cert_given = cert.is_some() || key.is_some();

        if sas_given && cert_given {
            return Err(ConfigError::Validation(
                "both SAS token (username/password) and certificate (cert_file/key_file) credentials are set; configure exactly one"
                    .to_string(),
            ));
        }

        if sas_given {
            return match (username, password) {
                (Some(username), Some(password)) => Ok(Some(AuthConfig::SasToken {
                    username: username.to_string(),
                    password: password.to_string(),
                })),
                (Some(_), None) => Err(ConfigError::Validation(
                    "remote.username is set but remote.password is missing".to_string(),
                )),
                _ => Err(ConfigError::Validation(
                    "remote.password is set but remote.username is missing".to_string(),
                )),
            };
        }

        if cert_given {
            return match (cert, key) {
                (Some(cert), Some(key)) => Ok(Some(AuthConfig::Certificate {
                    cert_path: cert.to_path_buf(),
                    key_path: key.to_path_buf(),
                    ca_path: self.ca_file().map(Path::to_path_buf),
                })),
                (Some(_), None) => Err(ConfigError::Validation(
                    "remote.cert_file is set but remote.key_file is missing".to_string(),
                )),
                _ => Err(ConfigError::Validation(
                    "remote.key_file is set but remote.cert_file is missing".to_string(),
                )),
            };
        }

        Ok(None)
    }
}
