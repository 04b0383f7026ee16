//! Connection state tracking

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::metrics::Metrics;

/// State of one MQTT link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Usable: CONNACK received (remote) or SUBACK received (local)
    Connected,
    /// Link failed, waiting for the next attempt
    ReconnectPending,
}

impl ConnectionState {
    /// Numeric value exported through the connection state gauge
    pub fn as_gauge(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::ReconnectPending => 3,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ReconnectPending => write!(f, "reconnect-pending"),
        }
    }
}

/// Shared, observable connection state of one link
#[derive(Clone)]
pub struct StateTracker {
    link: &'static str,
    tx: Arc<watch::Sender<ConnectionState>>,
    metrics: Arc<Metrics>,
}

impl StateTracker {
    pub fn new(link: &'static str, metrics: Arc<Metrics>) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        metrics.set_connection_state(link, ConnectionState::Disconnected);
        Self {
            link,
            tx: Arc::new(tx),
            metrics,
        }
    }

    pub fn link(&self) -> &'static str {
        self.link
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    /// Record a transition. Repeated values are ignored.
    pub fn set(&self, state: ConnectionState) {
        let mut previous = state;
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            previous = *current;
            *current = state;
            true
        });

        if changed {
            self.metrics.set_connection_state(self.link, state);
            if state == ConnectionState::Connected {
                info!(link = self.link, "Link connected");
            } else {
                debug!(link = self.link, from = %previous, to = %state, "Link state changed");
            }
        }
    }

    /// Watch for transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_are_observable() {
        let tracker = StateTracker::new("remote", Arc::new(Metrics::new()));
        let mut rx = tracker.subscribe();
        assert_eq!(tracker.get(), ConnectionState::Disconnected);

        tracker.set(ConnectionState::Connecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);

        tracker.set(ConnectionState::Connecting);
        assert!(!rx.has_changed().unwrap());

        tracker.set(ConnectionState::Connected);
        assert!(tracker.is_connected());
    }

    #[test]
    fn test_state_is_exported_as_gauge() {
        let metrics = Arc::new(Metrics::new());
        let tracker = StateTracker::new("local", metrics.clone());
        tracker.set(ConnectionState::ReconnectPending);
        assert_eq!(metrics.connection_state.with_label_values(&["local"]).get(), 3);
    }
}
