//! Prometheus metrics for the proxy
//!
//! Counters for the message pipeline plus per-link connection state, exposed
//! at the /metrics endpoint when the metrics server is enabled.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::link::ConnectionState;

mod server;

pub use server::MetricsServer;

/// All proxy metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Pipeline
    pub messages_received: IntCounter,
    pub messages_forwarded: IntCounter,
    pub messages_logged: IntCounter,
    pub messages_dropped: IntCounterVec,
    pub payload_fallback: IntCounter,
    pub publish_acks: IntCounter,

    // Links
    pub reconnects: IntCounterVec,
    pub connection_state: IntGaugeVec,

    // Performance
    pub enrich_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = IntCounter::with_opts(Opts::new(
            "mqtt_proxy_messages_received_total",
            "Messages received from the local broker",
        ))
        .expect("valid metric");

        let messages_forwarded = IntCounter::with_opts(Opts::new(
            "mqtt_proxy_messages_forwarded_total",
            "Envelopes handed to the remote broker",
        ))
        .expect("valid metric");

        let messages_logged = IntCounter::with_opts(Opts::new(
            "mqtt_proxy_messages_logged_total",
            "Envelopes logged in log-only mode",
        ))
        .expect("valid metric");

        let messages_dropped = IntCounterVec::new(
            Opts::new(
                "mqtt_proxy_messages_dropped_total",
                "Messages dropped before reaching the remote broker",
            ),
            &["reason"],
        )
        .expect("valid metric");

        let payload_fallback = IntCounter::with_opts(Opts::new(
            "mqtt_proxy_payload_fallback_total",
            "Payloads wrapped as text because they were not valid JSON",
        ))
        .expect("valid metric");

        let publish_acks = IntCounter::with_opts(Opts::new(
            "mqtt_proxy_publish_acks_total",
            "PUBACKs received from the remote broker",
        ))
        .expect("valid metric");

        let reconnects = IntCounterVec::new(
            Opts::new(
                "mqtt_proxy_reconnects_total",
                "Reconnect attempts scheduled per link",
            ),
            &["link"],
        )
        .expect("valid metric");

        let connection_state = IntGaugeVec::new(
            Opts::new(
                "mqtt_proxy_connection_state",
                "Link state: 0 disconnected, 1 connecting, 2 connected, 3 reconnect pending",
            ),
            &["link"],
        )
        .expect("valid metric");

        let enrich_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "mqtt_proxy_enrich_seconds",
                "Time spent building an envelope",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05,
            ]),
        )
        .expect("valid metric");

        registry
            .register(Box::new(messages_received.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(messages_forwarded.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(messages_logged.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(messages_dropped.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(payload_fallback.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(publish_acks.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(reconnects.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(connection_state.clone()))
            .expect("unique metric");
        registry
            .register(Box::new(enrich_seconds.clone()))
            .expect("unique metric");

        Self {
            registry,
            messages_received,
            messages_forwarded,
            messages_logged,
            messages_dropped,
            payload_fallback,
            publish_acks,
            reconnects,
            connection_state,
            enrich_seconds,
        }
    }

    pub fn message_dropped(&self, reason: &str) {
        self.messages_dropped.with_label_values(&[reason]).inc();
    }

    pub fn set_connection_state(&self, link: &str, state: ConnectionState) {
        self.connection_state
            .with_label_values(&[link])
            .set(state.as_gauge());
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, TextEncoder};

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new();
        metrics.messages_received.inc();
        metrics.message_dropped("not_connected");
        metrics.set_connection_state("remote", ConnectionState::Connected);

        let text = metrics.render().unwrap();
        assert!(text.contains("mqtt_proxy_messages_received_total 1"));
        assert!(text.contains("mqtt_proxy_messages_dropped_total{reason=\"not_connected\"} 1"));
        assert!(text.contains("mqtt_proxy_connection_state{link=\"remote\"} 2"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.messages_forwarded.inc();
        assert_eq!(a.messages_forwarded.get(), 1);
        assert_eq!(b.messages_forwarded.get(), 0);
    }
}
