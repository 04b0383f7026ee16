//! MQTT Links
//!
//! A link is one client connection to a broker driven by a rumqttc event
//! loop. The driver in this module owns the event loop, tracks the link's
//! [`ConnectionState`], and reconnects with capped exponential backoff. What a
//! link does with its traffic is decided by a [`LinkHandler`].

mod backoff;
mod state;

pub use backoff::Backoff;
pub use state::{ConnectionState, StateTracker};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::metrics::Metrics;

/// Upper bound for flushing queued requests and the DISCONNECT on shutdown
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the rumqttc request channel
pub(crate) const REQUEST_CAPACITY: usize = 64;

/// Link-specific reaction to broker traffic
#[async_trait]
pub(crate) trait LinkHandler: Send {
    /// Called after every accepted CONNACK, including reconnects
    async fn on_connected(
        &mut self,
        client: &AsyncClient,
        state: &StateTracker,
    ) -> Result<(), ConnectionError>;

    /// Called for every other incoming packet
    async fn on_packet(
        &mut self,
        packet: Packet,
        state: &StateTracker,
    ) -> Result<(), ConnectionError>;
}

/// Owns one rumqttc event loop and keeps it connected
pub(crate) struct LinkDriver {
    client: AsyncClient,
    event_loop: EventLoop,
    backoff: Backoff,
    state: StateTracker,
    metrics: Arc<Metrics>,
}

impl LinkDriver {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        backoff: Backoff,
        state: StateTracker,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            event_loop,
            backoff,
            state,
            metrics,
        }
    }

    /// Drive the link until `cancel` fires
    pub async fn run<H: LinkHandler>(mut self, mut handler: H, cancel: CancellationToken) {
        let link = self.state.link();
        // Session established at the network level (CONNACK seen, no error since)
        let mut session_up = false;

        self.state.set(ConnectionState::Connecting);

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!(link, session_present = ack.session_present, "CONNACK received");
                            session_up = true;
                            self.backoff.reset();
                            handler.on_connected(&self.client, &self.state).await
                        } else {
                            Err(ConnectionError::Refused(format!("{:?}", ack.code)))
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        session_up = false;
                        Err(ConnectionError::Lost("broker sent DISCONNECT".to_string()))
                    }
                    Ok(Event::Incoming(packet)) => handler.on_packet(packet, &self.state).await,
                    Ok(Event::Outgoing(_)) => Ok(()),
                    Err(e) => {
                        session_up = false;
                        Err(ConnectionError::from(e))
                    }
                },
            };

            let Err(error) = outcome else {
                continue;
            };

            self.state.set(ConnectionState::ReconnectPending);
            self.metrics.reconnects.with_label_values(&[link]).inc();
            let delay = self.backoff.next_delay();
            warn!(
                link,
                error = %error,
                retry_in_ms = delay.as_millis() as u64,
                "Link unavailable, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            self.state.set(ConnectionState::Connecting);

            // The transport survived (e.g. a rejected SUBACK): retry the
            // post-connect step instead of waiting for a new CONNACK
            if session_up {
                if let Err(e) = handler.on_connected(&self.client, &self.state).await {
                    debug!(link, error = %e, "Post-connect retry failed");
                }
            }
        }

        self.disconnect().await;
    }

    /// Send DISCONNECT and flush it, bounded by [`DISCONNECT_GRACE`]
    async fn disconnect(&mut self) {
        let link = self.state.link();

        if self.state.is_connected() && self.client.try_disconnect().is_ok() {
            let event_loop = &mut self.event_loop;
            let flush = async {
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
                debug!(link, "Timed out flushing DISCONNECT");
            }
        }

        self.state.set(ConnectionState::Disconnected);
        info!(link, "Link closed");
    }
}
