//! mqtt-sensor-sim - publishes canned sensor readings to the local broker
//!
//! Reads every `*.json` file in the data directory and publishes the readings
//! round-robin at QoS 1, one every `--interval` seconds.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use mqtt_proxy::logging;
use mqtt_proxy::signal::shutdown_signal;
use mqtt_proxy::simulator::{self, SimulatorConfig};

/// Sensor simulator for the local MQTT broker
#[derive(Parser, Debug)]
#[command(name = "mqtt-sensor-sim")]
#[command(version)]
#[command(about = "Publish test sensor readings to an MQTT broker")]
struct Args {
    /// Broker host
    #[arg(long, env = "MQTT_BROKER", default_value = "mqtt-broker")]
    host: String,

    /// Broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Topic to publish to
    #[arg(long, env = "MQTT_TOPIC", default_value = "sensor/data")]
    topic: String,

    /// Directory holding the *.json test data files
    #[arg(long, env = "TEST_DATA_DIR", default_value = "test-data")]
    data_dir: PathBuf,

    /// Seconds between two messages
    #[arg(long, env = "PUBLISH_INTERVAL", default_value_t = 5)]
    interval: u64,

    /// Stop after this many messages
    #[arg(long)]
    count: Option<u64>,

    /// MQTT client identifier
    #[arg(long, default_value = "test_client")]
    client_id: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(&args.log_level) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }

    let shutdown = match shutdown_signal() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            error!("Failed to install signal handlers: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = SimulatorConfig {
        host: args.host,
        port: args.port,
        topic: args.topic,
        client_id: args.client_id,
        data_dir: args.data_dir,
        interval: Duration::from_secs(args.interval.max(1)),
        count: args.count,
    };

    match simulator::run(config, shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
