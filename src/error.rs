//! Proxy error taxonomy
//!
//! Only configuration problems are fatal. Connection, serialization and
//! publish errors are recovered from in place and surfaced through logging.

use std::fmt;

use crate::config::ConfigError;

/// Transient failure on either MQTT link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The broker refused the connection (bad CONNACK)
    Refused(String),
    /// The network connection dropped or could not be opened
    Lost(String),
    /// The broker rejected the subscription
    SubscriptionRejected(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Refused(msg) => write!(f, "Connection refused: {}", msg),
            ConnectionError::Lost(msg) => write!(f, "Connection lost: {}", msg),
            ConnectionError::SubscriptionRejected(filter) => {
                write!(f, "Subscription rejected for '{}'", filter)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<rumqttc::ConnectionError> for ConnectionError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        match e {
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                ConnectionError::Refused(format!("{:?}", code))
            }
            other => ConnectionError::Lost(other.to_string()),
        }
    }
}

/// A payload could not be decoded as JSON and was embedded as a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationError {
    pub reason: String,
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload is not valid JSON: {}", self.reason)
    }
}

impl std::error::Error for SerializationError {}

impl From<serde_json::Error> for SerializationError {
    fn from(e: serde_json::Error) -> Self {
        SerializationError {
            reason: e.to_string(),
        }
    }
}

/// Failure to hand an envelope to the remote broker. The envelope is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Remote link is not connected
    NotConnected,
    /// Publish did not complete within the configured timeout
    Timeout,
    /// Envelope could not be encoded
    Encode(String),
    /// MQTT client rejected the request
    Client(String),
    /// Sink has been closed
    Closed,
}

impl PublishError {
    /// Short label used for the dropped-messages metric
    pub fn reason(&self) -> &'static str {
        match self {
            PublishError::NotConnected => "not_connected",
            PublishError::Timeout => "timeout",
            PublishError::Encode(_) => "encode",
            PublishError::Client(_) => "client",
            PublishError::Closed => "closed",
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConnected => write!(f, "Remote broker not connected"),
            PublishError::Timeout => write!(f, "Publish timed out"),
            PublishError::Encode(msg) => write!(f, "Encode error: {}", msg),
            PublishError::Client(msg) => write!(f, "Client error: {}", msg),
            PublishError::Closed => write!(f, "Publisher closed"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<rumqttc::ClientError> for PublishError {
    fn from(e: rumqttc::ClientError) -> Self {
        PublishError::Client(e.to_string())
    }
}

/// Top-level error returned by the bridge and binaries
#[derive(Debug)]
pub enum ProxyError {
    /// Fatal, reported before any connection is attempted
    Config(ConfigError),
    /// IO failure outside of the MQTT links
    Io(std::io::Error),
}

impl ProxyError {
    /// Whether this error should be reported as a configuration failure
    pub fn is_config(&self) -> bool {
        matches!(self, ProxyError::Config(_))
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(e) => write!(f, "Configuration error: {}", e),
            ProxyError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<ConfigError> for ProxyError {
    fn from(e: ConfigError) -> Self {
        ProxyError::Config(e)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e)
    }
}
