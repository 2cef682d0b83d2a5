//! HTTP server exposing the scrape endpoint and health checks.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::PrometheusConfig;

use super::ProxyMetrics;

/// Body returned by the health endpoints.
const HEALTH_BODY: &str = r#"{"status":"healthy","service":"packetpony"}"#;

/// Result alias for metrics server operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Errors raised by the metrics server.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics server is already running")]
    AlreadyRunning,

    #[error("metrics server is not running")]
    NotRunning,

    #[error("failed to bind metrics endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Serves the Prometheus scrape body and the health endpoints.
#[derive(Debug)]
pub struct MetricsServer {
    config: PrometheusConfig,
    metrics: Arc<ProxyMetrics>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    bound_addr: Option<SocketAddr>,
}

impl MetricsServer {
    /// Create a server for the given configuration.
    #[must_use]
    pub fn new(config: PrometheusConfig, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            config,
            metrics,
            shutdown_tx: None,
            bound_addr: None,
        }
    }

    /// Bind and start serving. A no-op when the endpoint is disabled.
    pub async fn start(&mut self) -> MetricsResult<()> {
        if self.shutdown_tx.is_some() {
            return Err(MetricsError::AlreadyRunning);
        }

        if !self.config.enabled {
            info!("prometheus endpoint is disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| MetricsError::Bind {
                addr: self.config.listen_address.clone(),
                source: e,
            })?;

        self.bound_addr = listener.local_addr().ok();
        info!(
            address = %self.config.listen_address,
            path = %self.config.path,
            "prometheus endpoint listening"
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let metrics = Arc::clone(&self.metrics);
        let path = self.config.path.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                debug!(%remote, "metrics connection");
                                let metrics = Arc::clone(&metrics);
                                let path = path.clone();

                                tokio::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let service = service_fn(move |req| {
                                        let metrics = Arc::clone(&metrics);
                                        let path = path.clone();
                                        async move { handle_request(&req, &metrics, &path) }
                                    });

                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!(error = %e, "metrics connection error");
                                    }
                                });
                            }
                            Err(e) => error!(error = %e, "metrics accept error"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("prometheus endpoint shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop serving.
    pub async fn stop(&mut self) -> MetricsResult<()> {
        match self.shutdown_tx.take() {
            Some(tx) => {
                let _ = tx.send(()).await;
                Ok(())
            }
            None => Err(MetricsError::NotRunning),
        }
    }

    /// Whether the server is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// The bound address, once started.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }
}

fn handle_request(
    req: &Request<Incoming>,
    metrics: &ProxyMetrics,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();

    let response = if path == metrics_path {
        Response::builder()
            .status(StatusCode::OK)
            .header(
                "Content-Type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Full::new(Bytes::from(metrics.encode())))
    } else if path == "/health" || path == "/healthz" || path == "/ready" {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(HEALTH_BODY)))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
    };

    Ok(response.expect("response build failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server(enabled: bool) -> MetricsServer {
        let config = PrometheusConfig {
            enabled,
            listen_address: "127.0.0.1:0".to_string(),
            path: "/metrics".to_string(),
        };
        MetricsServer::new(config, Arc::new(ProxyMetrics::new()))
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut server = server(true);
        server.start().await.unwrap();
        assert!(server.is_running());

        assert!(matches!(
            server.start().await,
            Err(MetricsError::AlreadyRunning)
        ));

        server.stop().await.unwrap();
        assert!(matches!(server.stop().await, Err(MetricsError::NotRunning)));
    }

    #[tokio::test]
    async fn test_disabled_does_not_bind() {
        let mut server = server(false);
        server.start().await.unwrap();
        assert!(!server.is_running());
        assert!(server.bound_addr().is_none());
    }

    #[tokio::test]
    async fn test_scrape_and_health() {
        let mut server = server(true);
        server.metrics.inc_acl_drop("web");
        server.start().await.unwrap();
        let addr = server.bound_addr().unwrap();

        let scrape = http_get(addr, "/metrics").await;
        assert!(scrape.contains("200 OK"));
        assert!(scrape.contains("packetpony_acl_drops_total{listener=\"web\"} 1"));

        for path in ["/health", "/healthz", "/ready"] {
            let health = http_get(addr, path).await;
            assert!(health.contains("200 OK"));
            assert!(health.contains(r#"{"status":"healthy","service":"packetpony"}"#));
        }

        let missing = http_get(addr, "/nope").await;
        assert!(missing.contains("404"));

        server.stop().await.unwrap();
    }
}
