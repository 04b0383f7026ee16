//! Bridge Controller Tests
//!
//! The controller runs against in-memory fakes so the pipeline can be driven
//! without a broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::envelope::Envelope;
use crate::link::StateTracker;

const SENSOR_01: &[u8] =
    br#"{"sensor_id":"sensor_01","type":"temperature","value":22.5,"unit":"celsius"}"#;

/// Source fed by the test through a channel
struct FakeSource {
    feed: Option<mpsc::UnboundedReceiver<RawMessage>>,
    state: StateTracker,
}

impl FakeSource {
    fn new(metrics: Arc<Metrics>) -> (Self, mpsc::UnboundedSender<RawMessage>) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let source = Self {
            feed: Some(feed_rx),
            state: StateTracker::new("local", metrics),
        };
        (source, feed_tx)
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    fn name(&self) -> &str {
        "fake-local"
    }

    fn state(&self) -> StateTracker {
        self.state.clone()
    }

    async fn run(&mut self, tx: mpsc::Sender<RawMessage>, cancel: CancellationToken) {
        let Some(mut feed) = self.feed.take() else {
            return;
        };
        self.state.set(ConnectionState::Connected);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = feed.recv() => match message {
                    Some(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

/// One publish attempt seen by the fake sink
#[derive(Debug)]
struct Attempt {
    envelope: Envelope,
    delivered: bool,
}

/// Sink whose availability is toggled by the test
struct FakeSink {
    available: Arc<AtomicBool>,
    attempts: mpsc::UnboundedSender<Attempt>,
    closed: Arc<AtomicBool>,
}

impl FakeSink {
    fn new() -> (Self, SinkHandle) {
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        let available = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(AtomicBool::new(false));
        let sink = Self {
            available: available.clone(),
            attempts: attempts_tx,
            closed: closed.clone(),
        };
        let handle = SinkHandle {
            available,
            attempts: attempts_rx,
            closed,
        };
        (sink, handle)
    }
}

#[async_trait]
impl EnvelopeSink for FakeSink {
    fn name(&self) -> &str {
        "fake-remote"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<Delivery, PublishError> {
        let delivered = self.available.load(Ordering::SeqCst);
        let _ = self.attempts.send(Attempt {
            envelope: envelope.clone(),
            delivered,
        });
        if delivered {
            Ok(Delivery::Forwarded)
        } else {
            Err(PublishError::NotConnected)
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct SinkHandle {
    available: Arc<AtomicBool>,
    attempts: mpsc::UnboundedReceiver<Attempt>,
    closed: Arc<AtomicBool>,
}

impl SinkHandle {
    async fn next_attempt(&mut self) -> Attempt {
        tokio::time::timeout(Duration::from_secs(5), self.attempts.recv())
            .await
            .expect("publish attempt within 5s")
            .expect("sink alive")
    }
}

/// Sink that never completes a publish
struct StalledSink;

#[async_trait]
impl EnvelopeSink for StalledSink {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn publish(&self, _envelope: &Envelope) -> Result<Delivery, PublishError> {
        std::future::pending().await
    }
}

struct Harness {
    feed: mpsc::UnboundedSender<RawMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    state: watch::Receiver<BridgeState>,
    task: tokio::task::JoinHandle<BridgeSummary>,
    metrics: Arc<Metrics>,
}

impl Harness {
    fn start(sink: Box<dyn EnvelopeSink>, options: BridgeOptions) -> Self {
        let metrics = Arc::new(Metrics::new());
        let (source, feed) = FakeSource::new(metrics.clone());
        let controller = BridgeController::new(
            Box::new(source),
            sink,
            Enricher::default(),
            options,
            metrics.clone(),
        );
        let state = controller.state();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(controller.run(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            feed,
            shutdown: Some(shutdown_tx),
            state,
            task,
            metrics,
        }
    }

    fn send(&self, payload: &'static [u8]) {
        self.feed
            .send(RawMessage::new("sensor/data", payload))
            .unwrap();
    }

    async fn wait_for(&mut self, target: BridgeState) {
        tokio::time::timeout(Duration::from_secs(5), self.state.wait_for(|s| *s == target))
            .await
            .expect("state reached within 5s")
            .unwrap();
    }

    async fn stop(mut self) -> BridgeSummary {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("bridge stopped within 10s")
            .unwrap()
    }
}

#[tokio::test]
async fn test_sensor_reading_is_forwarded_as_envelope() {
    let (sink, mut handle) = FakeSink::new();
    let mut harness = Harness::start(Box::new(sink), BridgeOptions::default());
    harness.wait_for(BridgeState::Running).await;

    harness.send(SENSOR_01);
    let attempt = handle.next_attempt().await;
    assert!(attempt.delivered);

    let mut wire: serde_json::Value =
        serde_json::from_slice(&attempt.envelope.to_bytes().unwrap()).unwrap();
    assert!(wire["timestamp"].as_str().unwrap().ends_with("+00:00"));
    wire.as_object_mut().unwrap().remove("timestamp");
    assert_eq!(
        wire,
        json!({
            "original_data": {
                "sensor_id": "sensor_01",
                "type": "temperature",
                "value": 22.5,
                "unit": "celsius"
            },
            "processed_by": "mqtt-proxy",
            "source": "on-premises-mqtt"
        })
    );

    let summary = harness.stop().await;
    assert_eq!(summary.received, 1);
    assert_eq!(summary.forwarded, 1);
    assert!(handle.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_remote_outage_drops_without_queueing() {
    let (sink, mut handle) = FakeSink::new();
    let mut harness = Harness::start(Box::new(sink), BridgeOptions::default());
    harness.wait_for(BridgeState::Running).await;

    harness.send(br#"{"seq":1}"#);
    let first = handle.next_attempt().await;
    assert!(first.delivered);

    handle.available.store(false, Ordering::SeqCst);
    harness.send(br#"{"seq":2}"#);
    let second = handle.next_attempt().await;
    assert!(!second.delivered);

    handle.available.store(true, Ordering::SeqCst);
    harness.send(br#"{"seq":3}"#);
    let third = handle.next_attempt().await;
    assert!(third.delivered);
    assert_eq!(third.envelope.original_data, json!({"seq": 3}));

    // Local intake never stopped
    assert_eq!(*harness.state.borrow(), BridgeState::Running);

    let metrics = harness.metrics.clone();
    let summary = harness.stop().await;
    assert_eq!(
        summary,
        BridgeSummary {
            received: 3,
            forwarded: 2,
            logged: 0,
            dropped: 1,
            fallbacks: 0,
        }
    );
    // The dropped message was attempted exactly once
    assert!(handle.attempts.try_recv().is_err());
    assert_eq!(
        metrics
            .messages_dropped
            .with_label_values(&["not_connected"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_log_only_mode_processes_without_forwarding() {
    let mut harness = Harness::start(Box::new(LogOnlySink), BridgeOptions::default());
    harness.wait_for(BridgeState::Running).await;

    harness.send(SENSOR_01);
    harness.send(b"plain text reading");

    let metrics = harness.metrics.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while metrics.messages_logged.get() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both messages logged");

    let summary = harness.stop().await;
    assert_eq!(summary.logged, 2);
    assert_eq!(summary.forwarded, 0);
    assert_eq!(summary.fallbacks, 1);
}

#[tokio::test]
async fn test_publish_timeout_drops_message() {
    let options = BridgeOptions {
        publish_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let mut harness = Harness::start(Box::new(StalledSink), options);
    harness.wait_for(BridgeState::Running).await;

    harness.send(SENSOR_01);

    let metrics = harness.metrics.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while metrics.messages_dropped.with_label_values(&["timeout"]).get() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message dropped on timeout");

    let summary = harness.stop().await;
    assert_eq!(summary.dropped, 1);
}

#[tokio::test]
async fn test_shutdown_moves_through_draining_to_stopped() {
    let (sink, _handle) = FakeSink::new();
    let mut harness = Harness::start(Box::new(sink), BridgeOptions::default());
    harness.wait_for(BridgeState::Running).await;

    let mut state = harness.state.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = seen.clone();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                seen.lock().push(*state.borrow_and_update());
            }
        })
    };

    let summary = harness.stop().await;
    recorder.await.unwrap();

    assert_eq!(summary, BridgeSummary::default());
    assert_eq!(seen.lock().last(), Some(&BridgeState::Stopped));
}

#[tokio::test]
async fn test_messages_received_before_shutdown_are_drained() {
    let (sink, mut handle) = FakeSink::new();
    let mut harness = Harness::start(Box::new(sink), BridgeOptions::default());
    harness.wait_for(BridgeState::Running).await;

    for _ in 0..5 {
        harness.send(SENSOR_01);
    }
    let summary = harness.stop().await;

    let mut attempts = 0;
    while handle.attempts.try_recv().is_ok() {
        attempts += 1;
    }
    assert_eq!(summary.received as usize, attempts);
    assert_eq!(summary.forwarded, summary.received);
}

#[test]
fn test_bridge_options_from_config() {
    let config = BridgeConfig {
        publish_timeout: Duration::from_secs(2),
        channel_capacity: 16,
        ..Default::default()
    };
    let options = BridgeOptions::from(&config);
    assert_eq!(options.publish_timeout, Duration::from_secs(2));
    assert_eq!(options.channel_capacity, 16);
}

#[tokio::test]
async fn test_from_config_log_only() {
    let config = Config::parse(
        r#"
[bridge]
mode = "log_only"
processed_by = "edge-01"
"#,
    )
    .unwrap();

    let controller = BridgeController::from_config(&config, Arc::new(Metrics::new())).unwrap();
    assert_eq!(controller.sink.name(), "log");
    assert_eq!(controller.enricher.processed_by(), "edge-01");
    assert_eq!(*controller.state().borrow(), BridgeState::Starting);
}
