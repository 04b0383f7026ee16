//! Local Subscriber
//!
//! Maintains the subscription on the local broker and turns every inbound
//! PUBLISH into a [`RawMessage`] for the bridge.

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, Packet, QoS, SubscribeReasonCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::LocalConfig;
use crate::envelope::RawMessage;
use crate::error::ConnectionError;
use crate::link::{
    Backoff, ConnectionState, LinkDriver, LinkHandler, StateTracker, REQUEST_CAPACITY,
};
use crate::metrics::Metrics;
use crate::topic::topic_matches_filter;

/// Producer of raw messages for the bridge
#[async_trait]
pub trait MessageSource: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Connection state of the source
    fn state(&self) -> StateTracker;

    /// Deliver messages into `tx` until `cancel` fires
    async fn run(&mut self, tx: mpsc::Sender<RawMessage>, cancel: CancellationToken);
}

/// Subscriber on the local broker
pub struct LocalSubscriber {
    config: LocalConfig,
    state: StateTracker,
    metrics: Arc<Metrics>,
}

impl LocalSubscriber {
    pub fn new(config: LocalConfig, metrics: Arc<Metrics>) -> Self {
        let state = StateTracker::new("local", metrics.clone());
        Self {
            config,
            state,
            metrics,
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options
    }
}

#[async_trait]
impl MessageSource for LocalSubscriber {
    fn name(&self) -> &str {
        "local"
    }

    fn state(&self) -> StateTracker {
        self.state.clone()
    }

    async fn run(&mut self, tx: mpsc::Sender<RawMessage>, cancel: CancellationToken) {
        info!(
            host = %self.config.host,
            port = self.config.port,
            topic = %self.config.topic,
            "Connecting to local broker"
        );

        let (client, event_loop) = AsyncClient::new(self.mqtt_options(), REQUEST_CAPACITY);
        let backoff = Backoff::new(
            self.config.reconnect_interval,
            self.config.max_reconnect_interval,
        );
        let driver = LinkDriver::new(
            client,
            event_loop,
            backoff,
            self.state.clone(),
            self.metrics.clone(),
        );
        let handler = SubscribeHandler {
            topic: self.config.topic.clone(),
            tx,
        };

        driver.run(handler, cancel).await;
    }
}

/// Subscribes after every CONNACK and forwards matching publishes
struct SubscribeHandler {
    topic: String,
    tx: mpsc::Sender<RawMessage>,
}

#[async_trait]
impl LinkHandler for SubscribeHandler {
    async fn on_connected(
        &mut self,
        client: &AsyncClient,
        _state: &StateTracker,
    ) -> Result<(), ConnectionError> {
        // Connected only once the SUBACK confirms the subscription
        client
            .subscribe(self.topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;
        debug!(topic = %self.topic, "SUBSCRIBE sent");
        Ok(())
    }

    async fn on_packet(
        &mut self,
        packet: Packet,
        state: &StateTracker,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::SubAck(ack) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if rejected {
                    return Err(ConnectionError::SubscriptionRejected(self.topic.clone()));
                }
                info!(topic = %self.topic, "Subscribed to local topic");
                state.set(ConnectionState::Connected);
            }
            Packet::Publish(publish) => {
                if !topic_matches_filter(&publish.topic, &self.topic) {
                    debug!(topic = %publish.topic, "Ignoring message outside subscription");
                    return Ok(());
                }
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "Message received");
                let message = RawMessage::new(publish.topic, publish.payload);
                if self.tx.send(message).await.is_err() {
                    debug!("Bridge channel closed, discarding message");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rumqttc::{Publish, SubAck};

    use super::*;

    fn handler(topic: &str) -> (SubscribeHandler, mpsc::Receiver<RawMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (
            SubscribeHandler {
                topic: topic.to_string(),
                tx,
            },
            rx,
        )
    }

    fn tracker() -> StateTracker {
        StateTracker::new("local", Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_suback_success_marks_connected() {
        let (mut handler, _rx) = handler("sensor/data");
        let state = tracker();
        state.set(ConnectionState::Connecting);

        let ack = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        handler.on_packet(Packet::SubAck(ack), &state).await.unwrap();
        assert_eq!(state.get(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_suback_failure_is_an_error() {
        let (mut handler, _rx) = handler("sensor/data");
        let state = tracker();
        state.set(ConnectionState::Connecting);

        let ack = SubAck::new(1, vec![SubscribeReasonCode::Failure]);
        let err = handler
            .on_packet(Packet::SubAck(ack), &state)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::SubscriptionRejected(_)));
        assert_eq!(state.get(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_publish_becomes_raw_message() {
        let (mut handler, mut rx) = handler("sensor/+");
        let state = tracker();

        let publish = Publish::new("sensor/temp", QoS::AtLeastOnce, br#"{"v":1}"#.to_vec());
        handler
            .on_packet(Packet::Publish(publish), &state)
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "sensor/temp");
        assert_eq!(&message.payload[..], br#"{"v":1}"#);
    }

    #[tokio::test]
    async fn test_publish_outside_filter_is_ignored() {
        let (mut handler, mut rx) = handler("sensor/data");
        let state = tracker();

        let publish = Publish::new("other/topic", QoS::AtLeastOnce, b"x".to_vec());
        handler
            .on_packet(Packet::Publish(publish), &state)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
