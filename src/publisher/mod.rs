//! Envelope Sinks
//!
//! Where enriched envelopes go: the remote broker over TLS
//! ([`RemotePublisher`]) or the log ([`LogOnlySink`]).

pub mod tls;

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AuthConfig, ConfigError, RemoteConfig};
use crate::envelope::Envelope;
use crate::error::{ConnectionError, PublishError};
use crate::link::{
    Backoff, ConnectionState, LinkDriver, LinkHandler, StateTracker, REQUEST_CAPACITY,
};
use crate::metrics::Metrics;

/// Outcome of a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the remote client at QoS 1
    Forwarded,
    /// Written to the log instead of being forwarded
    Logged,
}

/// Destination for enriched envelopes
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Connection state, for sinks that hold a connection
    fn state(&self) -> Option<StateTracker> {
        None
    }

    /// Deliver one envelope. Never retried by the caller.
    async fn publish(&self, envelope: &Envelope) -> Result<Delivery, PublishError>;

    /// Flush what can be flushed and release the sink
    async fn close(&mut self) {}
}

/// Publisher on the remote broker
pub struct RemotePublisher {
    client: AsyncClient,
    topic: String,
    state: StateTracker,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RemotePublisher {
    /// Build the TLS client and start connecting in the background.
    ///
    /// Certificate files are read here, so unreadable or malformed files
    /// fail startup instead of every connection attempt.
    pub fn start(
        config: &RemoteConfig,
        auth: &AuthConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        let tls = tls::client_config(auth, config.ca_file())?;

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(tls))));
        if let AuthConfig::SasToken { username, password } = auth {
            options.set_credentials(username.clone(), password.clone());
        }

        info!(
            host = %config.host,
            port = config.port,
            topic = %config.topic,
            auth = auth.kind(),
            "Connecting to remote broker"
        );

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let state = StateTracker::new("remote", metrics.clone());
        let backoff = Backoff::new(config.reconnect_interval, config.max_reconnect_interval);
        let driver = LinkDriver::new(
            client.clone(),
            event_loop,
            backoff,
            state.clone(),
            metrics.clone(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver.run(AckHandler { metrics }, cancel.clone()));

        Ok(Self {
            client,
            topic: config.topic.clone(),
            state,
            cancel,
            task: Some(task),
        })
    }
}

#[async_trait]
impl EnvelopeSink for RemotePublisher {
    fn name(&self) -> &str {
        "remote"
    }

    fn state(&self) -> Option<StateTracker> {
        Some(self.state.clone())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<Delivery, PublishError> {
        if !self.state.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let payload = envelope
            .to_bytes()
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .await?;

        Ok(Delivery::Forwarded)
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "Remote link task ended abnormally");
            }
        }
    }
}

/// Tracks readiness and counts PUBACKs on the remote link
struct AckHandler {
    metrics: Arc<Metrics>,
}

#[async_trait]
impl LinkHandler for AckHandler {
    async fn on_connected(
        &mut self,
        _client: &AsyncClient,
        state: &StateTracker,
    ) -> Result<(), ConnectionError> {
        state.set(ConnectionState::Connected);
        Ok(())
    }

    async fn on_packet(
        &mut self,
        packet: Packet,
        _state: &StateTracker,
    ) -> Result<(), ConnectionError> {
        if let Packet::PubAck(ack) = packet {
            debug!(pkid = ack.pkid, "PUBACK received");
            self.metrics.publish_acks.inc();
        }
        Ok(())
    }
}

/// Writes envelopes to the log instead of forwarding them
#[derive(Debug, Default)]
pub struct LogOnlySink;

#[async_trait]
impl EnvelopeSink for LogOnlySink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<Delivery, PublishError> {
        let rendered = envelope
            .to_pretty_string()
            .map_err(|e| PublishError::Encode(e.to_string()))?;
        info!("Log-only mode, envelope not forwarded:\n{}", rendered);
        Ok(Delivery::Logged)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::envelope::{enrich, RawMessage};

    #[tokio::test]
    async fn test_log_only_sink_logs() {
        let raw = RawMessage::received_at(
            "sensor/data",
            &br#"{"temperature":21.5}"#[..],
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        );
        let envelope = enrich(&raw, raw.received_at);
        let sink = LogOnlySink;
        assert_eq!(sink.publish(&envelope).await.unwrap(), Delivery::Logged);
        assert!(sink.state().is_none());
    }

    #[tokio::test]
    async fn test_remote_publisher_bad_ca_is_startup_error() {
        let config = RemoteConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut ca, b"not a certificate").unwrap();
        let config = RemoteConfig {
            ca_file: Some(ca.path().to_path_buf()),
            ..config
        };
        let auth = AuthConfig::SasToken {
            username: "proxy-client".to_string(),
            password: "token".to_string(),
        };

        // Bad CA bundle is a startup error
        let result = RemotePublisher::start(&config, &auth, Arc::new(Metrics::new()));
        assert!(matches!(result, Err(ConfigError::Tls(_))));
    }

    #[tokio::test]
    async fn test_remote_publisher_fails_fast_while_disconnected() {
        // Bind and release a port so nothing listens on it
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = RemoteConfig {
            host: "127.0.0.1".to_string(),
            port,
            reconnect_interval: Duration::from_millis(50),
            max_reconnect_interval: Duration::from_millis(200),
            ..Default::default()
        };
        let auth = AuthConfig::SasToken {
            username: "proxy-client".to_string(),
            password: "token".to_string(),
        };
        let metrics = Arc::new(Metrics::new());
        let mut publisher = RemotePublisher::start(&config, &auth, metrics.clone()).unwrap();

        let raw = RawMessage::new("sensor/data", &br#"{"value":1}"#[..]);
        let envelope = enrich(&raw, raw.received_at);

        let result = tokio::time::timeout(Duration::from_millis(100), publisher.publish(&envelope))
            .await
            .expect("publish does not block");
        assert!(matches!(result, Err(PublishError::NotConnected)));

        // Still failing fast once the link is retrying
        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.reconnects.with_label_values(&["remote"]).get() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconnect attempt");
        let result = tokio::time::timeout(Duration::from_millis(100), publisher.publish(&envelope))
            .await
            .expect("publish does not block");
        assert!(matches!(result, Err(PublishError::NotConnected)));

        publisher.close().await;
        assert_eq!(publisher.state.get(), ConnectionState::Disconnected);
    }
}
