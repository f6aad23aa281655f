//! Operator process lifecycle.
//!
//! The operator runs two long-lived tasks: the HTTP server exposing health & Prometheus metrics,
//! and the controllers reconciling CassandraDataCenters & CassandraBackups. A SIGTERM or SIGINT
//! broadcasts shutdown to both, after which the operator waits for them to stop. Backup monitors
//! are cancelled along with the controllers; their operations keep running on the node agents
//! and are resumed by the next operator process.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;
use crate::server::HttpServer;

/// The running Cassandra operator.
pub struct App {
    /// Broadcasts shutdown to the HTTP server & the controllers.
    shutdown_tx: broadcast::Sender<()>,
    /// Shutdown requested by one of the tasks.
    shutdown_rx: BroadcastStream<()>,

    /// Serves `/health` & `/metrics`.
    server: JoinHandle<Result<()>>,
    /// Runs the datacenter & backup controllers.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Bind the HTTP server & start the controllers.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);
        let client = kube::Client::try_default().await.context("error building K8s client from the environment")?;

        let server = HttpServer::new(config.clone(), metrics, shutdown_tx.clone())
            .await
            .context("error binding metrics & health server")?
            .spawn();
        let controller = Controller::new(client, config, shutdown_tx.clone()).spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("SIGTERM", SignalStream::new(signal(SignalKind::terminate()).context("error listening for SIGTERM")?));
        signals.insert("SIGINT", SignalStream::new(signal(SignalKind::interrupt()).context("error listening for SIGINT")?));

        tokio::select! {
            Some((name, _)) = signals.next() => tracing::info!(signal = name, "stopping controllers & metrics server"),
            _ = self.shutdown_rx.next() => tracing::info!("shutdown requested, stopping controllers & metrics server"),
        }
        let _ = self.shutdown_tx.send(());

        let (server, controller) = tokio::join!(self.server, self.controller);
        log_exit("metrics & health server", server);
        log_exit("controllers", controller);
        tracing::info!("cassandra operator stopped");
        Ok(())
    }
}

/// Log how one of the operator's tasks stopped.
fn log_exit(task: &str, res: std::result::Result<Result<()>, JoinError>) {
    match res {
        Ok(Ok(())) => tracing::debug!(task, "task stopped"),
        Ok(Err(err)) => tracing::error!(error = ?err, task, "task stopped with an error"),
        Err(err) => tracing::error!(error = %err, task, "task panicked or was aborted"),
    }
}
