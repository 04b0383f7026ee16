//! Bridge Controller
//!
//! Owns the local message source and the envelope sink and runs the
//! receive → enrich → publish pipeline between them.
//!
//! # Lifecycle
//!
//! `Starting → Running → Draining → Stopped`. The bridge is `Running` once the
//! local subscription is active; the remote link may still be connecting and
//! keeps reconnecting on its own. Messages that arrive while the remote link
//! is down are dropped, never queued. On shutdown the local link is closed
//! first, messages already received are processed within the drain timeout,
//! and then the sink is closed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, BridgeMode, Config, ConfigError};
use crate::envelope::{Enricher, Enrichment, RawMessage};
use crate::error::PublishError;
use crate::link::ConnectionState;
use crate::metrics::Metrics;
use crate::publisher::{Delivery, EnvelopeSink, LogOnlySink, RemotePublisher};
use crate::subscriber::{LocalSubscriber, MessageSource};

#[cfg(test)]
mod tests;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Starting => write!(f, "starting"),
            BridgeState::Running => write!(f, "running"),
            BridgeState::Draining => write!(f, "draining"),
            BridgeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Upper bound for handing one envelope to the sink
    pub publish_timeout: Duration,
    /// Upper bound for processing already-received messages on shutdown
    pub drain_timeout: Duration,
    /// Capacity of the channel between the local link and the pipeline
    pub channel_capacity: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for BridgeOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            publish_timeout: config.publish_timeout,
            drain_timeout: config.drain_timeout,
            channel_capacity: config.channel_capacity,
        }
    }
}

/// Message counts for one run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSummary {
    pub received: u64,
    pub forwarded: u64,
    pub logged: u64,
    pub dropped: u64,
    /// Payloads embedded as text because they were not JSON
    pub fallbacks: u64,
}

/// Wires a [`MessageSource`] through the [`Enricher`] into an [`EnvelopeSink`]
pub struct BridgeController {
    source: Option<Box<dyn MessageSource>>,
    sink: Box<dyn EnvelopeSink>,
    enricher: Enricher,
    options: BridgeOptions,
    metrics: Arc<Metrics>,
    state: watch::Sender<BridgeState>,
    summary: BridgeSummary,
}

impl BridgeController {
    pub fn new(
        source: Box<dyn MessageSource>,
        sink: Box<dyn EnvelopeSink>,
        enricher: Enricher,
        options: BridgeOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(BridgeState::Starting);
        Self {
            source: Some(source),
            sink,
            enricher,
            options,
            metrics,
            state,
            summary: BridgeSummary::default(),
        }
    }

    /// Build the real local subscriber and sink for `config`.
    ///
    /// Must be called inside a tokio runtime: in forward mode the remote
    /// link starts connecting immediately.
    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Result<Self, ConfigError> {
        let sink: Box<dyn EnvelopeSink> = match config.bridge.mode {
            BridgeMode::LogOnly => {
                warn!("Log-only mode: envelopes are logged and NOT forwarded to the remote broker");
                Box::new(LogOnlySink)
            }
            BridgeMode::Forward => {
                let auth = config.remote.auth()?.ok_or_else(|| {
                    ConfigError::Validation("no remote credentials configured".to_string())
                })?;
                Box::new(RemotePublisher::start(&config.remote, &auth, metrics.clone())?)
            }
        };

        let source = Box::new(LocalSubscriber::new(config.local.clone(), metrics.clone()));
        let enricher = Enricher::new(
            config.bridge.processed_by.clone(),
            config.bridge.source.clone(),
        );

        Ok(Self::new(
            source,
            sink,
            enricher,
            BridgeOptions::from(&config.bridge),
            metrics,
        ))
    }

    /// Watch the controller's lifecycle state
    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Bridge state changed");
        }
    }

    /// Run until `shutdown` resolves or the source stops, then drain
    pub async fn run<F>(mut self, shutdown: F) -> BridgeSummary
    where
        F: Future<Output = ()> + Send,
    {
        let Some(mut source) = self.source.take() else {
            return self.summary;
        };

        let (tx, mut rx) = mpsc::channel(self.options.channel_capacity);
        let local_cancel = CancellationToken::new();
        let local_state = source.state();
        let mut local_rx = local_state.subscribe();

        info!(
            source = source.name(),
            sink = self.sink.name(),
            "Starting bridge"
        );

        let cancel = local_cancel.clone();
        let source_task = tokio::spawn(async move {
            source.run(tx, cancel).await;
        });

        let mut starting = true;
        if local_state.is_connected() {
            self.set_state(BridgeState::Running);
            starting = false;
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                changed = local_rx.changed(), if starting => {
                    if changed.is_err() {
                        starting = false;
                    } else if *local_rx.borrow_and_update() == ConnectionState::Connected {
                        self.set_state(BridgeState::Running);
                        starting = false;
                    }
                }
                message = rx.recv() => match message {
                    Some(raw) => self.handle(raw).await,
                    None => {
                        warn!("Local source stopped");
                        break;
                    }
                },
            }
        }

        self.set_state(BridgeState::Draining);
        local_cancel.cancel();

        let drain_timeout = self.options.drain_timeout;
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(raw) = rx.recv().await {
                self.handle(raw).await;
            }
        })
        .await;

        if drained.is_err() {
            let mut abandoned = 0u64;
            while let Ok(raw) = rx.try_recv() {
                self.drop_message(&raw.topic, &PublishError::Closed);
                abandoned += 1;
            }
            warn!(
                abandoned,
                timeout_ms = drain_timeout.as_millis() as u64,
                "Drain timed out"
            );
        }
        drop(rx);

        if let Err(e) = source_task.await {
            debug!(error = %e, "Local link task ended abnormally");
        }
        self.sink.close().await;

        self.set_state(BridgeState::Stopped);
        let summary = self.summary;
        info!(
            received = summary.received,
            forwarded = summary.forwarded,
            logged = summary.logged,
            dropped = summary.dropped,
            fallbacks = summary.fallbacks,
            "Bridge stopped"
        );
        summary
    }

    /// Enrich one message and hand it to the sink
    async fn handle(&mut self, raw: RawMessage) {
        self.summary.received += 1;
        self.metrics.messages_received.inc();
        info!(topic = %raw.topic, bytes = raw.payload.len(), "Message received");

        let timer = self.metrics.enrich_seconds.start_timer();
        let Enrichment { envelope, fallback } = self.enricher.enrich(&raw, Utc::now());
        timer.observe_duration();

        if let Some(reason) = fallback {
            self.summary.fallbacks += 1;
            self.metrics.payload_fallback.inc();
            debug!(topic = %raw.topic, error = %reason, "Embedding payload as text");
        }

        let result =
            match tokio::time::timeout(self.options.publish_timeout, self.sink.publish(&envelope))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout),
            };

        match result {
            Ok(Delivery::Forwarded) => {
                self.summary.forwarded += 1;
                self.metrics.messages_forwarded.inc();
                debug!(topic = %raw.topic, "Envelope forwarded");
            }
            Ok(Delivery::Logged) => {
                self.summary.logged += 1;
                self.metrics.messages_logged.inc();
            }
            Err(e) => self.drop_message(&raw.topic, &e),
        }
    }

    fn drop_message(&mut self, topic: &str, error: &PublishError) {
        self.summary.dropped += 1;
        self.metrics.message_dropped(error.reason());
        warn!(topic = %topic, reason = error.reason(), error = %error, "Message dropped");
    }
}
