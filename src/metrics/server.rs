//! HTTP server for the metrics and health endpoints

use super::Metrics;
use crate::bridge::BridgeState;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// HTTP server exposing `/metrics`, `/healthz` and `/readyz`
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    bridge_state: watch::Receiver<BridgeState>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind the listener. Bind failures surface at startup.
    pub async fn bind(
        addr: SocketAddr,
        metrics: Arc<Metrics>,
        bridge_state: watch::Receiver<BridgeState>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            metrics,
            bridge_state,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        info!(
            "Metrics server listening on http://{}/metrics",
            self.listener.local_addr()?
        );

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };
            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();
            let bridge_state = self.bridge_state.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    let state = *bridge_state.borrow();
                    async move { handle_request(req, metrics, state).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }

        debug!("Metrics server stopped");
        Ok(())
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    state: BridgeState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.render() {
            Ok(text) => {
                let mut response = respond(StatusCode::OK, text);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "OK"),
        "/ready" | "/readyz" => {
            if state == BridgeState::Running {
                respond(StatusCode::OK, "OK")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, state.to_string())
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
