//! mqtt-proxy - enriching bridge from a local MQTT broker to a cloud broker
//!
//! Subscribes to a topic on the local broker, wraps every message in an
//! envelope carrying a timestamp and provenance fields, and republishes it
//! over TLS to the remote broker at QoS 1.

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod error;
pub mod link;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod signal;
pub mod simulator;
pub mod subscriber;
pub mod topic;

pub use bridge::{BridgeController, BridgeOptions, BridgeState, BridgeSummary};
pub use config::{AuthConfig, BridgeMode, Config, ConfigError};
pub use envelope::{enrich, Enricher, Envelope, RawMessage};
pub use error::{ConnectionError, ProxyError, PublishError, SerializationError};
pub use link::ConnectionState;
pub use metrics::{Metrics, MetricsServer};
pub use publisher::{Delivery, EnvelopeSink, LogOnlySink, RemotePublisher};
pub use subscriber::{LocalSubscriber, MessageSource};
