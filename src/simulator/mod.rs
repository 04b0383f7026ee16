//! Sensor Simulator
//!
//! Publishes canned sensor readings to the local broker so the proxy can be
//! exercised without real devices. Readings are loaded from the `*.json`
//! files of a directory and published round-robin at QoS 1.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::link::{
    Backoff, ConnectionState, LinkDriver, LinkHandler, StateTracker, REQUEST_CAPACITY,
};
use crate::metrics::Metrics;

#[derive(Debug)]
pub enum SimulatorError {
    /// The data directory holds no usable readings
    NoFixtures(PathBuf),
    Io(std::io::Error),
    Encode(serde_json::Error),
    Client(rumqttc::ClientError),
}

impl fmt::Display for SimulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulatorError::NoFixtures(dir) => {
                write!(f, "No test data found in {}", dir.display())
            }
            SimulatorError::Io(e) => write!(f, "IO error: {}", e),
            SimulatorError::Encode(e) => write!(f, "Encode error: {}", e),
            SimulatorError::Client(e) => write!(f, "Client error: {}", e),
        }
    }
}

impl std::error::Error for SimulatorError {}

impl From<std::io::Error> for SimulatorError {
    fn from(e: std::io::Error) -> Self {
        SimulatorError::Io(e)
    }
}

impl From<serde_json::Error> for SimulatorError {
    fn from(e: serde_json::Error) -> Self {
        SimulatorError::Encode(e)
    }
}

impl From<rumqttc::ClientError> for SimulatorError {
    fn from(e: rumqttc::ClientError) -> Self {
        SimulatorError::Client(e)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub data_dir: PathBuf,
    /// Pause between two publishes
    pub interval: Duration,
    /// Stop after this many messages; run until shutdown when unset
    pub count: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: "mqtt-broker".to_string(),
            port: 1883,
            topic: "sensor/data".to_string(),
            client_id: "test_client".to_string(),
            data_dir: PathBuf::from("test-data"),
            interval: Duration::from_secs(5),
            count: None,
        }
    }
}

/// Load readings from every `*.json` file in `dir`, in file name order.
///
/// A top-level array contributes each of its elements. Files that cannot be
/// read or parsed are skipped with a warning.
pub fn load_fixtures(dir: &Path) -> Result<Vec<Value>, SimulatorError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut readings = Vec::new();
    for path in files {
        let parsed = std::fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(|e| e.to_string()));

        match parsed {
            Ok(Value::Array(items)) => {
                info!(file = %path.display(), readings = items.len(), "Loaded test data");
                readings.extend(items);
            }
            Ok(value) => {
                info!(file = %path.display(), readings = 1, "Loaded test data");
                readings.push(value);
            }
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping test data file"),
        }
    }

    if readings.is_empty() {
        return Err(SimulatorError::NoFixtures(dir.to_path_buf()));
    }
    Ok(readings)
}

/// Marks the link usable on CONNACK; nothing else to react to
struct PublishOnly;

#[async_trait]
impl LinkHandler for PublishOnly {
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
            debug!(pkid = ack.pkid, "Message acknowledged");
        }
        Ok(())
    }
}

fn preview(payload: &str) -> &str {
    match payload.char_indices().nth(100) {
        Some((end, _)) => &payload[..end],
        None => payload,
    }
}

/// Publish readings until `count` is reached or `shutdown` resolves.
/// Returns the number of messages published.
pub async fn run<F>(config: SimulatorConfig, shutdown: F) -> Result<u64, SimulatorError>
where
    F: Future<Output = ()>,
{
    let readings = load_fixtures(&config.data_dir)?;
    info!(readings = readings.len(), "Loaded test messages");

    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(60));

    info!(host = %config.host, port = config.port, "Connecting to MQTT broker");
    let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let metrics = Arc::new(Metrics::new());
    let state = StateTracker::new("simulator", metrics.clone());
    let driver = LinkDriver::new(
        client.clone(),
        event_loop,
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        state,
        metrics,
    );
    let cancel = CancellationToken::new();
    let link = tokio::spawn(driver.run(PublishOnly, cancel.clone()));

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut published = 0u64;
    let result = loop {
        if config.count.is_some_and(|count| published >= count) {
            break Ok(());
        }

        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            _ = ticker.tick() => {}
        }

        let reading = &readings[(published % readings.len() as u64) as usize];
        let payload = match serde_json::to_string(reading) {
            Ok(payload) => payload,
            Err(e) => break Err(SimulatorError::from(e)),
        };
        if let Err(e) = client
            .publish(config.topic.clone(), QoS::AtLeastOnce, false, payload.clone())
            .await
        {
            break Err(SimulatorError::from(e));
        }
        published += 1;
        info!(n = published, payload = preview(&payload), "Published message");
    };

    cancel.cancel();
    if let Err(e) = link.await {
        debug!(error = %e, "Simulator link task ended abnormally");
    }

    info!(published, "Simulator stopped");
    result.map(|_| published)
}
