//! CassandraBackup operation tracking.
//!
//! ## Overview
//! A backup is started once, when its resource has no status yet. The backup operation is
//! started on the agent of every pod of the target datacenter, one after the other; pods whose
//! agent refuses are skipped and have no entry in the status. One monitor task is then spawned
//! per started node. A monitor polls its agent until the operation is terminal and writes each
//! observation into the backup's status.
//!
//! Monitors of the same backup race on its status, so every write is a fetch-modify-replace which
//! is retried when K8s rejects it as stale.
//!
//! Monitors outlive reconciles. They stop when their operation completes or fails, when their
//! agent can not be polled (beyond the configured tolerance), when the backup is deleted, or when
//! the operator shuts down. Backups whose monitors were lost with a previous operator process
//! are resumed from the operation IDs recorded in their status.
//!
//! A backup is tracked while at least one of its monitors runs. The last monitor to stop removes
//! its entry, so terminal & deleted backups hold no state in the tracker.

use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{Error, Result};
use crate::k8s::{resources, Deps, PodInfo, Severity};
use crate::sidecar::NodeAgent;
use cassandra_core::crd::{BackupParams, CassandraBackup, CassandraBackupStatus, CassandraDataCenter, RequiredMetadata};
use cassandra_core::sidecar::{OperationKind, OperationRequest, OperationState};
use cassandra_core::AppError;

/// The number of times a status write is retried after losing an update race.
const MAX_CONFLICT_RETRIES: usize = 10;

/// The reason a monitor stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorExit {
    /// The operation reached the given terminal state.
    Terminal(OperationState),
    /// The agent could not be polled.
    Unreachable,
    /// The backup resource no longer exists.
    Deleted,
    /// The operator is shutting down.
    Cancelled,
}

/// Drives backup operations on node agents to completion.
pub struct OperationTracker {
    deps: Deps,
    /// A channel used for stopping all monitors at shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// The number of running monitors of every tracked backup, keyed by UID.
    tracked: Arc<DashMap<String, usize>>,
}

impl OperationTracker {
    /// Create a new instance.
    pub fn new(deps: Deps, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            deps,
            shutdown_tx,
            tracked: Default::default(),
        }
    }

    /// Start or resume tracking of the given backup.
    ///
    /// Returns the handles of all monitors spawned by this call. Monitors are detached, dropping
    /// the handles does not stop them.
    #[tracing::instrument(level = "debug", skip(self, backup), fields(name = backup.name()))]
    pub async fn reconcile(&self, backup: &CassandraBackup) -> Result<Vec<JoinHandle<MonitorExit>>> {
        let key = backup
            .metadata
            .uid
            .clone()
            .unwrap_or_else(|| format!("{}/{}", backup.namespace(), backup.name()));
        if self.tracked.contains_key(&key) {
            return Ok(vec![]);
        }

        match &backup.status {
            None => self.start(key, backup).await,
            Some(status) if status.is_terminal() => Ok(vec![]),
            Some(status) => self.resume(key, backup, status).await,
        }
    }

    /// Stop every monitor of this tracker.
    pub fn cancel_all(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// The number of backups with running monitors.
    #[cfg(test)]
    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// Start the backup on every node of the target datacenter.
    async fn start(&self, key: String, backup: &CassandraBackup) -> Result<Vec<JoinHandle<MonitorExit>>> {
        let (ns, name) = (backup.namespace(), backup.name());
        let (dc, pods) = self.target_pods(backup).await?;

        // Start the operation on every node, one after the other.
        let req = OperationRequest::new(OperationKind::Backup, BackupParams::from(&backup.spec).into_map());
        let mut started = vec![];
        for pod in pods.iter() {
            let agent = self.deps.agents.connect(pod, dc.spec.sidecar_secure);
            match agent.start_operation(&req).await {
                Ok(id) => {
                    tracing::info!(node = %pod.name, operation = %id, "backup started on node");
                    started.push((agent, id));
                }
                Err(err) => tracing::error!(error = %err, node = %pod.name, "error starting backup on node, skipping"),
            }
        }
        if started.is_empty() {
            self.deps.events.emit(
                backup.object_ref(&()),
                Severity::Warning,
                "BackupNotStarted",
                format!("backup could not be started on any of the {} nodes of {}", pods.len(), dc.name()),
            );
        }

        // Record the started operations. Should this fail, the monitors record them on their first poll.
        let entries: Vec<(String, String)> = started.iter().map(|(agent, id)| (agent.id().to_string(), id.clone())).collect();
        let recorded = update_status(&self.deps, ns, name, |status| {
            for (node, id) in entries.iter() {
                status.record_operation(node, id, OperationState::Pending, 0.0);
            }
        })
        .await;
        match recorded {
            Ok(true) => (),
            Ok(false) => {
                tracing::debug!("backup deleted before its operations were recorded");
                return Ok(vec![]);
            }
            Err(err) => tracing::error!(error = %err, "error recording started backup operations"),
        }

        Ok(self.spawn_monitors(key, backup, started))
    }

    /// Resume monitoring the non-terminal nodes of a backup started by a previous process.
    async fn resume(&self, key: String, backup: &CassandraBackup, status: &CassandraBackupStatus) -> Result<Vec<JoinHandle<MonitorExit>>> {
        let (dc, pods) = self.target_pods(backup).await?;

        let mut targets = vec![];
        for entry in status.nodes.iter().filter(|entry| !entry.state.is_terminal()) {
            let id = match entry.operation_id.as_ref() {
                Some(id) => id,
                None => continue,
            };
            let pod = match pods.iter().find(|pod| pod.name == entry.node) {
                Some(pod) => pod,
                None => {
                    tracing::warn!(node = %entry.node, "pod of non-terminal backup node not found, not resuming");
                    continue;
                }
            };
            tracing::info!(node = %entry.node, operation = %id, "resuming backup monitor");
            targets.push((self.deps.agents.connect(pod, dc.spec.sidecar_secure), id.clone()));
        }
        Ok(self.spawn_monitors(key, backup, targets))
    }

    /// Fetch the target datacenter of a backup along with its pods.
    async fn target_pods(&self, backup: &CassandraBackup) -> Result<(CassandraDataCenter, Vec<PodInfo>)> {
        let ns = backup.namespace();
        let dc = match self.deps.api.get_datacenter(ns, &backup.spec.datacenter).await? {
            Some(dc) => dc,
            None => {
                let msg = format!("datacenter {} of backup {} does not exist", backup.spec.datacenter, backup.name());
                self.deps
                    .events
                    .emit(backup.object_ref(&()), Severity::Warning, "DataCenterNotFound", msg.clone());
                return Err(AppError::ResourceNotFound(msg).into());
            }
        };
        let pods = self.deps.api.list_pods(ns, &resources::datacenter_selector(&dc)).await?;
        Ok((dc, pods))
    }

    /// Track the given backup & spawn one monitor per started operation.
    fn spawn_monitors(&self, key: String, backup: &CassandraBackup, targets: Vec<(Arc<dyn NodeAgent>, String)>) -> Vec<JoinHandle<MonitorExit>> {
        if targets.is_empty() {
            return vec![];
        }
        self.tracked.insert(key.clone(), targets.len());
        let subject = backup.object_ref(&());
        targets
            .into_iter()
            .map(|(agent, operation_id)| {
                let monitor = Monitor {
                    deps: self.deps.clone(),
                    key: key.clone(),
                    tracked: self.tracked.clone(),
                    ns: backup.namespace().into(),
                    name: backup.name().into(),
                    subject: subject.clone(),
                    agent,
                    operation_id,
                    shutdown_rx: BroadcastStream::new(self.shutdown_tx.subscribe()),
                };
                tokio::spawn(monitor.run())
            })
            .collect()
    }
}

/// Polls a single node's backup operation until it is terminal.
struct Monitor {
    deps: Deps,
    /// The tracker key of the backup.
    key: String,
    tracked: Arc<DashMap<String, usize>>,
    ns: String,
    /// The name of the backup.
    name: String,
    /// The backup, as the subject of events.
    subject: ObjectReference,
    agent: Arc<dyn NodeAgent>,
    operation_id: String,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Monitor {
    #[tracing::instrument(level = "debug", skip(self), fields(backup = %self.name, node = %self.agent.id(), operation = %self.operation_id))]
    async fn run(mut self) -> MonitorExit {
        let active = metrics::gauge!("cassandra_operator_backup_monitors_active");
        active.increment(1.0);
        let exit = self.poll_until_done().await;
        active.decrement(1.0);
        tracing::debug!(?exit, "backup monitor stopped");
        exit
    }

    async fn poll_until_done(&mut self) -> MonitorExit {
        let mut interval = tokio::time::interval(self.deps.config.backup_poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let tolerance = self.deps.config.backup_poll_error_tolerance;
        let node = self.agent.id().to_string();
        let mut failures = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => return MonitorExit::Cancelled,
                _ = interval.tick() => (),
            }

            let record = match self.agent.find_operation(&self.operation_id).await {
                Ok(record) => {
                    failures = 0;
                    record
                }
                Err(err) => {
                    failures += 1;
                    if failures > tolerance {
                        tracing::error!(error = %err, failures, "error polling backup operation, giving up on node");
                        return MonitorExit::Unreachable;
                    }
                    tracing::warn!(error = %err, failures, "error polling backup operation");
                    continue;
                }
            };

            let written = update_status(&self.deps, &self.ns, &self.name, |status| {
                status.record_operation(&node, &self.operation_id, record.state, record.progress)
            })
            .await;
            match written {
                Ok(true) => (),
                Ok(false) => return MonitorExit::Deleted,
                Err(err) => {
                    tracing::error!(error = %err, "error writing backup status, retrying on next poll");
                    continue;
                }
            }

            if record.state.is_terminal() {
                self.emit_terminal(&node, record.state);
                return MonitorExit::Terminal(record.state);
            }
        }
    }

    fn emit_terminal(&self, node: &str, state: OperationState) {
        let (severity, reason, message) = match state {
            OperationState::Completed => (Severity::Normal, "BackupCompleted", format!("backup of node {} completed", node)),
            _ => (Severity::Warning, "BackupFailed", format!("backup of node {} failed", node)),
        };
        self.deps.events.emit(self.subject.clone(), severity, reason, message);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // The last monitor of a backup untracks it, also when unwinding.
        self.tracked.remove_if_mut(&self.key, |_, running| {
            *running = running.saturating_sub(1);
            *running == 0
        });
    }
}

/// Apply `update` to the latest status of a backup and write it back, retrying lost races.
///
/// Returns `false` if the backup no longer exists.
async fn update_status<F>(deps: &Deps, ns: &str, name: &str, update: F) -> Result<bool>
where
    F: Fn(&mut CassandraBackupStatus) + Send + Sync,
{
    for attempt in 0..MAX_CONFLICT_RETRIES {
        let mut backup = match deps.api.get_backup(ns, name).await? {
            Some(backup) => backup,
            None => return Ok(false),
        };
        update(backup.status.get_or_insert_with(Default::default));
        match deps.api.replace_backup_status(&backup).await {
            Ok(_) => return Ok(true),
            Err(err) if err.is_conflict() => {
                tracing::debug!(attempt, "conflict writing backup status, retrying");
                continue;
            }
            Err(Error::Kube(kube::Error::Api(resp))) if resp.code == 404 => return Ok(false),
            Err(err) => return Err(err),
        }
    }
    Err(Error::Conflict(format!("{}/{}", ns, name)))
}
