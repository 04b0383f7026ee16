//! mqtt-proxy - enriching MQTT bridge
//!
//! Usage:
//!   mqtt-proxy [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path (env MQTT_PROXY_CONFIG)
//!   -l, --log-level <LEVEL>   Log level (error, warn, info, debug, trace)
//!   --local-host <HOST>       Local broker host
//!   --local-port <PORT>       Local broker port
//!   --local-topic <FILTER>    Local subscription filter
//!   --remote-host <HOST>      Remote broker host
//!   --remote-topic <TOPIC>    Remote publish topic
//!   --log-only                Log envelopes instead of forwarding them
//!   --metrics-bind <ADDR>     Serve metrics and health endpoints on ADDR
//!   -h, --help                Print help
//!
//! Without `--config` the flat deployment variables (`LOCAL_MQTT_BROKER`,
//! `EVENTGRID_MQTT_HOSTNAME`, `MQTT_USERNAME`, ...) are used.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mqtt_proxy::config::{BridgeMode, Config};
use mqtt_proxy::signal::shutdown_signal;
use mqtt_proxy::{logging, BridgeController, Metrics, MetricsServer, ProxyError};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Enriching MQTT bridge from a local broker to a cloud broker
#[derive(Parser, Debug)]
#[command(name = "mqtt-proxy")]
#[command(version)]
#[command(about = "Subscribe locally, enrich, republish to the cloud over TLS")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, env = "MQTT_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Local broker host
    #[arg(long)]
    local_host: Option<String>,

    /// Local broker port
    #[arg(long)]
    local_port: Option<u16>,

    /// Local subscription filter
    #[arg(long)]
    local_topic: Option<String>,

    /// Remote broker host
    #[arg(long)]
    remote_host: Option<String>,

    /// Remote publish topic
    #[arg(long)]
    remote_topic: Option<String>,

    /// Log envelopes instead of forwarding them
    #[arg(long)]
    log_only: bool,

    /// Serve /metrics, /healthz and /readyz on this address
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,
}

impl Args {
    /// Load the configuration, apply command line overrides, validate
    fn resolve_config(&self) -> Result<Config, ProxyError> {
        let mut config = match &self.config {
            Some(path) => Config::load_raw(path)?,
            None => Config::from_env_raw()?,
        };

        if let Some(level) = self.log_level {
            config.log.level = level.as_str().to_string();
        }
        if let Some(host) = &self.local_host {
            config.local.host = host.clone();
        }
        if let Some(port) = self.local_port {
            config.local.port = port;
        }
        if let Some(topic) = &self.local_topic {
            config.local.topic = topic.clone();
        }
        if let Some(host) = &self.remote_host {
            config.remote.host = host.clone();
        }
        if let Some(topic) = &self.remote_topic {
            config.remote.topic = topic.clone();
        }
        if self.log_only {
            config.bridge.mode = BridgeMode::LogOnly;
        }
        if let Some(bind) = self.metrics_bind {
            config.metrics.enabled = true;
            config.metrics.bind = bind;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match args.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_code(&e);
        }
    };

    if let Err(e) = logging::init(&config.log.level) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, args.config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            exit_code(&e)
        }
    }
}

fn exit_code(error: &ProxyError) -> ExitCode {
    if error.is_config() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

async fn run(config: Config, config_path: Option<PathBuf>) -> Result<(), ProxyError> {
    info!("Starting mqtt-proxy v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("  Config: {}", path.display()),
        None => info!("  Config: environment"),
    }
    info!(
        "  Local: {}:{} topic '{}'",
        config.local.host, config.local.port, config.local.topic
    );
    match config.bridge.mode {
        BridgeMode::Forward => info!(
            "  Remote: {}:{} topic '{}' as '{}'",
            config.remote.host, config.remote.port, config.remote.topic, config.remote.client_id
        ),
        BridgeMode::LogOnly => info!("  Remote: disabled (log-only)"),
    }

    let shutdown = shutdown_signal()?;
    let metrics = Arc::new(Metrics::new());
    let controller = BridgeController::from_config(&config, metrics.clone())?;

    let server_cancel = CancellationToken::new();
    let server_task = if config.metrics.enabled {
        let server =
            MetricsServer::bind(config.metrics.bind, metrics.clone(), controller.state()).await?;
        info!("  Metrics: enabled (http://{})", server.local_addr()?);
        let cancel = server_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(cancel).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let summary = controller.run(shutdown).await;

    server_cancel.cancel();
    if let Some(task) = server_task {
        let _ = task.await;
    }

    info!(
        "Shutdown complete: {} received, {} forwarded, {} logged, {} dropped",
        summary.received, summary.forwarded, summary.logged, summary.dropped
    );
    Ok(())
}
