//! Kubernetes controllers.
//!
//! Two kube-runtime controllers run side by side. The datacenter controller watches
//! CassandraDataCenters along with the StatefulSets, Services & ConfigMaps they own, and converges
//! each datacenter towards its spec one topology change at a time. The backup controller watches
//! CassandraBackups and hands them to the operation tracker, which drives them to completion.
//!
//! Reconcile failures are retried with a per-object exponential backoff, except for invariant
//! violations, which wait for the next change of the object.

mod api;
mod backup;
#[cfg(test)]
mod backup_test;
mod datacenter;
mod decommission;
mod events;
#[cfg(test)]
mod fixtures;
mod guard;
mod racks;
mod resources;
mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::watcher;
use kube::Resource;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::error::Error;
use crate::sidecar::{AgentConnector, HttpAgentConnector};
use cassandra_core::crd::{CassandraBackup, CassandraDataCenter, RequiredMetadata};
use cassandra_core::OPERATOR_LABEL_SELECTORS;

pub use api::{ClusterApi, KubeClusterApi, PodInfo};
pub use backup::{MonitorExit, OperationTracker};
pub use events::{EventSink, KubeEventSink, Severity};

/// The app name used by the operator.
pub const APP_NAME: &str = "cassandra-operator";
/// The delay before the first retry of a failed reconcile.
const BACKOFF_BASE: Duration = Duration::from_secs(5);
/// The upper bound of the delay between retries of a failed reconcile.
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// The dependencies of all reconciliation components.
#[derive(Clone)]
pub struct Deps {
    pub api: Arc<dyn ClusterApi>,
    pub agents: Arc<dyn AgentConnector>,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<Config>,
}

/// The retry policy of a failed reconcile: doubles from 5s up to 5m, without ever giving up.
pub fn retry_backoff() -> ExponentialBackoff {
    let mut new = ExponentialBackoff::default();
    new.initial_interval = BACKOFF_BASE;
    new.max_interval = BACKOFF_MAX;
    new.multiplier = 2.0;
    new.randomization_factor = 0.0;
    new.max_elapsed_time = None;
    new.reset();
    new
}

/// Shared state of the controllers' reconcilers.
struct Context {
    deps: Deps,
    tracker: OperationTracker,
    /// Retry backoffs of objects whose last reconcile failed, per object key.
    backoffs: DashMap<String, ExponentialBackoff>,
}

impl Context {
    /// Record a failed reconcile of the given key, returning the delay before its retry.
    fn backoff(&self, key: String) -> Duration {
        let mut backoff = self.backoffs.entry(key).or_insert_with(retry_backoff);
        backoff.next_backoff().unwrap_or(BACKOFF_MAX)
    }

    /// Reset the backoff of the given key after a successful reconcile.
    fn reset_backoff(&self, key: &str) {
        self.backoffs.remove(key);
    }
}

fn object_key<K: RequiredMetadata + Resource<DynamicType = ()>>(obj: &K) -> String {
    format!("{}/{}/{}", K::kind(&()), obj.namespace(), obj.name())
}

/// Kubernetes controller for CassandraDataCenters & CassandraBackups.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let deps = Deps {
            api: Arc::new(KubeClusterApi::new(self.client.clone())),
            agents: Arc::new(HttpAgentConnector::new(self.config.sidecar_port)?),
            events: Arc::new(KubeEventSink::new(self.client.clone(), &self.config.pod_name)),
            config: self.config.clone(),
        };
        let ctx = Arc::new(Context {
            tracker: OperationTracker::new(deps.clone(), self.shutdown_tx.clone()),
            deps,
            backoffs: Default::default(),
        });

        // Build controller streams.
        let params_labels = watcher::Config::default().labels(OPERATOR_LABEL_SELECTORS);
        let datacenters = KubeController::new(self.api::<CassandraDataCenter>(), watcher::Config::default())
            .owns(self.api::<StatefulSet>(), params_labels.clone())
            .owns(self.api::<Service>(), params_labels.clone())
            .owns(self.api::<ConfigMap>(), params_labels)
            .run(reconcile_datacenter, datacenter_error_policy, ctx.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => tracing::debug!(object = %obj, "datacenter reconciled"),
                    Err(err) => tracing::debug!(error = ?err, "datacenter reconcile failed"),
                }
            });
        let backups = KubeController::new(self.api::<CassandraBackup>(), watcher::Config::default())
            .run(reconcile_backup, backup_error_policy, ctx.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => tracing::debug!(object = %obj, "backup reconciled"),
                    Err(err) => tracing::debug!(error = ?err, "backup reconcile failed"),
                }
            });

        tracing::info!("k8s controllers initialized");
        tokio::select! {
            _ = datacenters => tracing::warn!("datacenter controller stopped"),
            _ = backups => tracing::warn!("backup controller stopped"),
            _ = self.shutdown_rx.next() => (),
        }

        ctx.tracker.cancel_all();
        tracing::debug!("k8s controllers shutdown");
        Ok(())
    }

    /// An API for the given resource type, scoped to the configured namespace if any.
    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        if self.config.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.namespace)
        }
    }
}

async fn reconcile_datacenter(dc: Arc<CassandraDataCenter>, ctx: Arc<Context>) -> std::result::Result<Action, Error> {
    match datacenter::reconcile(&ctx.deps, dc.namespace(), dc.name()).await {
        Ok(outcome) => {
            ctx.reset_backoff(&object_key(dc.as_ref()));
            metrics::counter!("cassandra_operator_reconciles_total", "kind" => "datacenter", "result" => outcome.metric_label()).increment(1);
            Ok(outcome.action(ctx.deps.config.requeue_interval()))
        }
        Err(err) => {
            metrics::counter!("cassandra_operator_reconciles_total", "kind" => "datacenter", "result" => err.metric_label()).increment(1);
            let reason = if err.is_invariant_violation() { "InvariantViolation" } else { "ReconcileFailed" };
            ctx.deps.events.emit(dc.object_ref(&()), Severity::Warning, reason, err.to_string());
            Err(err)
        }
    }
}

fn datacenter_error_policy(dc: Arc<CassandraDataCenter>, err: &Error, ctx: Arc<Context>) -> Action {
    if err.is_invariant_violation() {
        tracing::error!(error = %err, name = dc.name(), "datacenter requires manual intervention, waiting for a change");
        return Action::await_change();
    }
    let delay = ctx.backoff(object_key(dc.as_ref()));
    tracing::error!(error = %err, name = dc.name(), ?delay, "error reconciling datacenter");
    Action::requeue(delay)
}

async fn reconcile_backup(backup: Arc<CassandraBackup>, ctx: Arc<Context>) -> std::result::Result<Action, Error> {
    match ctx.tracker.reconcile(&backup).await {
        Ok(_monitors) => {
            ctx.reset_backoff(&object_key(backup.as_ref()));
            metrics::counter!("cassandra_operator_reconciles_total", "kind" => "backup", "result" => "ok").increment(1);
            Ok(Action::await_change())
        }
        Err(err) => {
            metrics::counter!("cassandra_operator_reconciles_total", "kind" => "backup", "result" => err.metric_label()).increment(1);
            Err(err)
        }
    }
}

fn backup_error_policy(backup: Arc<CassandraBackup>, err: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff(object_key(backup.as_ref()));
    tracing::error!(error = %err, name = backup.name(), ?delay, "error reconciling backup");
    Action::requeue(delay)
}
