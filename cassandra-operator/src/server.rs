//! HTTP server for healthchecks & metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, Router};
use axum::Extension;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// The operator's HTTP server.
pub struct HttpServer {
    listener: TcpListener,
    metrics: PrometheusHandle,
    shutdown_rx: broadcast::Receiver<()>,
}

impl HttpServer {
    /// Create a new instance, binding to the configured HTTP port.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .context("error binding socket address for http server")?;
        Ok(Self {
            listener,
            metrics,
            shutdown_rx: shutdown.subscribe(),
        })
    }

    /// The address this server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error getting local address of http server")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let router = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/metrics", get(prom_metrics))
            .layer(Extension(self.metrics));
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("http server is listening at {}", addr);
        }

        let mut shutdown_rx = self.shutdown_rx;
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            })
            .await
            .context("error serving http")?;
        tracing::debug!("http server shutdown");
        Ok(())
    }
}

async fn prom_metrics(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}
