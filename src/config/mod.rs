//! Configuration Module
//!
//! Provides TOML-based configuration for the proxy with support for:
//! - Local broker connection and subscription
//! - Remote broker connection and credentials
//! - Bridge behaviour (forward or log-only, envelope metadata, timeouts)
//! - Metrics endpoint
//! - Environment variable overrides (MQTT_PROXY__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::builder::{ConfigBuilder, DefaultState};
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::envelope::{DEFAULT_PROCESSED_BY, DEFAULT_SOURCE};
use crate::publisher::tls::TlsError;
use crate::topic::{validate_topic_filter, validate_topic_name};

pub use remote::{AuthConfig, RemoteConfig};

mod remote;


/// Flat environment variables of container deployments read by
/// [`Config::from_env`], with the key each one sets
const DEPLOYMENT_VARS: &[(&str, &str)] = &[
    ("LOG_LEVEL", "log.level"),
    ("LOCAL_MQTT_BROKER", "local.host"),
    ("LOCAL_MQTT_PORT", "local.port"),
    ("LOCAL_MQTT_TOPIC", "local.topic"),
    ("EVENTGRID_MQTT_HOSTNAME", "remote.host"),
    ("EVENTGRID_MQTT_PORT", "remote.port"),
    ("EVENTGRID_MQTT_TOPIC", "remote.topic"),
    ("MQTT_CLIENT_ID", "remote.client_id"),
    ("MQTT_USERNAME", "remote.username"),
    ("MQTT_PASSWORD", "remote.password"),
    ("MQTT_CERT_FILE", "remote.cert_file"),
    ("MQTT_KEY_FILE", "remote.key_file"),
    ("MQTT_CA_CERTS", "remote.ca_file"),
    ("PROXY_MODE", "bridge.mode"),
];

/// Minimum keep-alive accepted by the MQTT client
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax; as in a shell, an empty
/// variable takes the default.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| default.to_string())
    })
    .to_string()
}

/// Value of a deployment variable; unset, blank and non-unicode count as absent
fn deployment_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
    /// Certificate or key material could not be loaded
    Tls(TlsError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::Tls(e) => write!(f, "TLS error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<TlsError> for ConfigError {
    fn from(e: TlsError) -> Self {
        ConfigError::Tls(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local (subscribe side) broker
    pub local: LocalConfig,
    /// Remote (publish side) broker
    pub remote: RemoteConfig,
    /// Bridge behaviour
    pub bridge: BridgeConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Local broker connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub host: String,
    pub port: u16,
    /// Subscription filter, wildcards allowed
    pub topic: String,
    pub client_id: String,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// First reconnect delay
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Reconnect delay cap
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: "mqtt-broker".to_string(),
            port: 1883,
            topic: "sensor/data".to_string(),
            client_id: "mqtt-proxy_subscriber".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_interval: Duration::from_secs(60),
        }
    }
}

/// What the bridge does with enriched messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Publish to the remote broker
    #[default]
    Forward,
    /// Only write envelopes to the log (local development)
    LogOnly,
}

impl std::fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeMode::Forward => write!(f, "forward"),
            BridgeMode::LogOnly => write!(f, "log_only"),
        }
    }
}

/// Bridge behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    /// `processed_by` field of every envelope
    pub processed_by: String,
    /// `source` field of every envelope
    pub source: String,
    /// Upper bound for handing one envelope to the remote client
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    /// Upper bound for flushing in-flight messages on shutdown
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// Capacity of the subscriber → controller channel
    pub channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: BridgeMode::Forward,
            processed_by: DEFAULT_PROCESSED_BY.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            publish_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            channel_capacity: 1024,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the HTTP endpoint is served
    pub enabled: bool,
    /// HTTP bind address for metrics endpoint
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTT_PROXY__` prefix with double underscores for nesting:
    ///    - `MQTT_PROXY__REMOTE__HOST=ns.westeurope-1.ts.eventgrid.azure.net` overrides `remote.host`
    ///    - `MQTT_PROXY__BRIDGE__MODE=log_only` overrides `bridge.mode`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_raw(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation, so that command line
    /// overrides can be applied before [`Config::validate`] runs
    pub fn load_raw<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::build(&content)
    }

    /// Load configuration from the flat deployment environment variables
    /// (`LOCAL_MQTT_BROKER`, `EVENTGRID_MQTT_HOSTNAME`, `MQTT_PASSWORD`, ...)
    /// plus `MQTT_PROXY__*` overrides.
    ///
    /// Values are taken verbatim; blank values count as unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_env_raw()?;
        config.validate()?;
        Ok(config)
    }

    /// Unvalidated counterpart of [`Config::from_env`]
    pub fn from_env_raw() -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;
        // Deployment variables sit on the file layer: above the built-in
        // defaults, below MQTT_PROXY__* overrides
        for (var, key) in DEPLOYMENT_VARS {
            if let Some(value) = deployment_var(var) {
                builder = builder.set_default(*key, value)?;
            }
        }

        let cfg = builder.add_source(Self::env_overrides()).build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Load from TOML text with env substitution and overrides applied
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let config = Self::build(content)?;
        config.validate()?;
        Ok(config)
    }

    fn build(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);

        let cfg = Self::defaults()?
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .add_source(Self::env_overrides())
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("local.host", "mqtt-broker")?
            .set_default("local.port", 1883)?
            .set_default("local.topic", "sensor/data")?
            .set_default("local.client_id", "mqtt-proxy_subscriber")?
            .set_default("local.keep_alive", "60s")?
            .set_default("local.reconnect_interval", "5s")?
            .set_default("local.max_reconnect_interval", "60s")?
            .set_default("remote.host", "")?
            .set_default("remote.port", 8883)?
            .set_default("remote.topic", "sensor/data")?
            .set_default("remote.client_id", "mqtt-proxy")?
            .set_default("remote.keep_alive", "60s")?
            .set_default("remote.reconnect_interval", "5s")?
            .set_default("remote.max_reconnect_interval", "60s")?
            .set_default("bridge.mode", "forward")?
            .set_default("bridge.processed_by", DEFAULT_PROCESSED_BY)?
            .set_default("bridge.source", DEFAULT_SOURCE)?
            .set_default("bridge.publish_timeout", "5s")?
            .set_default("bridge.drain_timeout", "5s")?
            .set_default("bridge.channel_capacity", 1024)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?)
    }

    // Double underscore separates nested keys, single underscore preserved in field names
    fn env_overrides() -> Environment {
        Environment::with_prefix("MQTT_PROXY")
            .separator("__")
            .try_parsing(true)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Runs before any connection is opened; every error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let local = &self.local;
        if local.host.trim().is_empty() {
            return Err(ConfigError::Validation("local.host is required".to_string()));
        }
        if local.port == 0 {
            return Err(ConfigError::Validation("local.port cannot be 0".to_string()));
        }
        if local.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "local.client_id cannot be empty".to_string(),
            ));
        }
        validate_topic_filter(&local.topic)
            .map_err(|e| ConfigError::Validation(format!("local.topic: {}", e)))?;
        validate_timings(
            "local",
            local.keep_alive,
            local.reconnect_interval,
            local.max_reconnect_interval,
        )?;

        let remote = &self.remote;
        if remote.port == 0 {
            return Err(ConfigError::Validation("remote.port cannot be 0".to_string()));
        }
        if remote.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "remote.client_id cannot be empty".to_string(),
            ));
        }
        validate_topic_name(&remote.topic)
            .map_err(|e| ConfigError::Validation(format!("remote.topic: {}", e)))?;
        validate_timings(
            "remote",
            remote.keep_alive,
            remote.reconnect_interval,
            remote.max_reconnect_interval,
        )?;

        // Conflicting or partial credentials are rejected in every mode
        let auth = remote.auth()?;

        if self.bridge.mode == BridgeMode::Forward {
            if remote.host.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "remote.host is required in forward mode (set bridge.mode = \"log_only\" to run without a remote broker)"
                        .to_string(),
                ));
            }
            if auth.is_none() {
                return Err(ConfigError::Validation(
                    "no remote credentials configured: set remote.username + remote.password (SAS token) or remote.cert_file + remote.key_file (certificate)"
                        .to_string(),
                ));
            }
        }

        if self.bridge.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "bridge.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.bridge.publish_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "bridge.publish_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_timings(
    section: &str,
    keep_alive: Duration,
    reconnect: Duration,
    max_reconnect: Duration,
) -> Result<(), ConfigError> {
    if keep_alive < MIN_KEEP_ALIVE {
        return Err(ConfigError::Validation(format!(
            "{}.keep_alive must be at least {}s",
            section,
            MIN_KEEP_ALIVE.as_secs()
        )));
    }
    if reconnect.is_zero() {
        return Err(ConfigError::Validation(format!(
            "{}.reconnect_interval must be greater than 0",
            section
        )));
    }
    if max_reconnect < reconnect {
        return Err(ConfigError::Validation(format!(
            "{}.max_reconnect_interval must not be less than reconnect_interval",
            section
        )));
    }
    Ok(())
}
