//! In-memory fakes of the K8s API, node agents & event sink.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Service};
use kube::api::ObjectMeta;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::k8s::{ClusterApi, Deps, EventSink, PodInfo, Severity};
use crate::sidecar::{AgentConnector, AgentError, NodeAgent};
use cassandra_core::crd::{
    CassandraBackup, CassandraBackupSpec, CassandraDataCenter, CassandraDataCenterSpec, CassandraDataCenterStatus, DataVolumeClaimSpec, RackSpec,
};
use cassandra_core::sidecar::{NodeState, OperationKind, OperationRecord, OperationRequest, OperationState};

pub const NAMESPACE: &str = "default";

/// Build a datacenter with the given number of nodes over the given racks.
pub fn datacenter(nodes: u32, racks: &[&str]) -> CassandraDataCenter {
    let mut dc = CassandraDataCenter::new(
        "dc1",
        CassandraDataCenterSpec {
            cluster: "c1".into(),
            datacenter: "dc1".into(),
            nodes,
            racks: racks
                .iter()
                .map(|name| RackSpec {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            cassandra_image: "cassandra:4.1".into(),
            sidecar_image: "cassandra-sidecar:latest".into(),
            image_pull_policy: None,
            resources: None,
            data_volume_claim: DataVolumeClaimSpec {
                storage: "10Gi".into(),
                ..Default::default()
            },
            sidecar_secure: false,
        },
    );
    dc.metadata.namespace = Some(NAMESPACE.into());
    dc.metadata.uid = Some("dc-uid".into());
    dc
}

/// Build a backup of the `dc1` datacenter.
pub fn backup(name: &str) -> CassandraBackup {
    let mut backup = CassandraBackup::new(
        name,
        CassandraBackupSpec {
            datacenter: "dc1".into(),
            storage_location: "s3://backups/c1".into(),
            snapshot_tag: "nightly".into(),
            keyspaces: None,
            table: None,
            duration: None,
            bandwidth: None,
            concurrent_connections: None,
        },
    );
    backup.metadata.namespace = Some(NAMESPACE.into());
    backup.metadata.uid = Some(format!("{}-uid", name));
    backup
}

/// A running pod with an address.
pub fn pod(name: &str) -> PodInfo {
    PodInfo {
        name: name.into(),
        ip: Some("10.0.0.1".into()),
        running: true,
    }
}

/// Build the dependencies of reconciliation components from the given fakes.
pub fn deps(api: &Arc<FakeClusterApi>, agents: &Arc<FakeConnector>, events: &Arc<FakeEvents>) -> Deps {
    Deps {
        api: api.clone(),
        agents: agents.clone(),
        events: events.clone(),
        config: Arc::new(Config::new_test()),
    }
}

//////////////////////////////////////////////////////////////////////////////
// ClusterApi ////////////////////////////////////////////////////////////////

/// A mutation recorded by the fake K8s API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    CreateStatefulSet { name: String, replicas: u32 },
    ScaleStatefulSet { name: String, replicas: u32 },
    CreateService(String),
    CreateConfigMap(String),
}

#[derive(Default)]
struct ClusterState {
    datacenters: BTreeMap<String, CassandraDataCenter>,
    statefulsets: BTreeMap<String, StatefulSet>,
    services: BTreeMap<String, Service>,
    config_maps: BTreeMap<String, ConfigMap>,
    pods: Vec<PodInfo>,
    backups: BTreeMap<String, CassandraBackup>,
    resource_version: u64,
    mutations: Vec<Mutation>,
    status_patches: usize,
}

/// An in-memory `ClusterApi` of a single namespace.
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<ClusterState>,
    /// The number of backup status writes which are still to be rejected as conflicts.
    conflicts: AtomicU32,
}

impl FakeClusterApi {
    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_datacenter(&self, dc: CassandraDataCenter) {
        let name = dc.metadata.name.clone().unwrap_or_default();
        self.state().datacenters.insert(name, dc);
    }

    pub fn datacenter(&self, name: &str) -> Option<CassandraDataCenter> {
        self.state().datacenters.get(name).cloned()
    }

    pub fn add_backup(&self, backup: CassandraBackup) {
        let mut state = self.state();
        state.resource_version += 1;
        let mut backup = backup;
        backup.metadata.resource_version = Some(state.resource_version.to_string());
        let name = backup.metadata.name.clone().unwrap_or_default();
        state.backups.insert(name, backup);
    }

    pub fn backup(&self, name: &str) -> Option<CassandraBackup> {
        self.state().backups.get(name).cloned()
    }

    pub fn remove_backup(&self, name: &str) {
        self.state().backups.remove(name);
    }

    pub fn set_pods(&self, pods: Vec<PodInfo>) {
        self.state().pods = pods;
    }

    pub fn statefulset(&self, name: &str) -> Option<StatefulSet> {
        self.state().statefulsets.get(name).cloned()
    }

    /// Set the spec & ready replicas of a StatefulSet, creating it if needed.
    pub fn set_statefulset(&self, name: &str, replicas: u32, ready: u32) {
        let mut state = self.state();
        let sts = state.statefulsets.entry(name.into()).or_insert_with(|| StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(NAMESPACE.into()),
                ..Default::default()
            },
            ..Default::default()
        });
        sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas as i32);
        sts.status = Some(StatefulSetStatus {
            replicas: replicas as i32,
            ready_replicas: Some(ready as i32),
            ..Default::default()
        });
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state().mutations.clear();
    }

    pub fn status_patches(&self) -> usize {
        self.state().status_patches
    }

    /// Reject the next `count` backup status writes with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn get_datacenter(&self, _ns: &str, name: &str) -> Result<Option<CassandraDataCenter>> {
        Ok(self.datacenter(name))
    }

    async fn patch_datacenter_status(&self, dc: &CassandraDataCenter, status: &CassandraDataCenterStatus) -> Result<()> {
        let mut state = self.state();
        state.status_patches += 1;
        let name = dc.metadata.name.clone().unwrap_or_default();
        if let Some(stored) = state.datacenters.get_mut(&name) {
            stored.status = Some(status.clone());
        }
        Ok(())
    }

    async fn get_statefulset(&self, _ns: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.statefulset(name))
    }

    async fn list_statefulsets(&self, _ns: &str, _selector: &str) -> Result<Vec<StatefulSet>> {
        Ok(self.state().statefulsets.values().cloned().collect())
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        let name = sts.metadata.name.clone().unwrap_or_default();
        if state.statefulsets.contains_key(&name) {
            return Err(anyhow::anyhow!("statefulset {} already exists", name).into());
        }
        let replicas = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1) as u32;
        state.mutations.push(Mutation::CreateStatefulSet { name: name.clone(), replicas });
        state.statefulsets.insert(name, sts.clone());
        Ok(sts.clone())
    }

    async fn scale_statefulset(&self, _ns: &str, name: &str, replicas: u32) -> Result<()> {
        let mut state = self.state();
        let sts = state
            .statefulsets
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("statefulset {} not found", name))?;
        sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas as i32);
        state.mutations.push(Mutation::ScaleStatefulSet { name: name.into(), replicas });
        Ok(())
    }

    async fn ensure_service(&self, service: &Service) -> Result<()> {
        let mut state = self.state();
        let name = service.metadata.name.clone().unwrap_or_default();
        if !state.services.contains_key(&name) {
            state.mutations.push(Mutation::CreateService(name.clone()));
            state.services.insert(name, service.clone());
        }
        Ok(())
    }

    async fn ensure_config_map(&self, cm: &ConfigMap) -> Result<()> {
        let mut state = self.state();
        let name = cm.metadata.name.clone().unwrap_or_default();
        if !state.config_maps.contains_key(&name) {
            state.mutations.push(Mutation::CreateConfigMap(name.clone()));
            state.config_maps.insert(name, cm.clone());
        }
        Ok(())
    }

    async fn list_pods(&self, _ns: &str, _selector: &str) -> Result<Vec<PodInfo>> {
        Ok(self.state().pods.clone())
    }

    async fn get_backup(&self, _ns: &str, name: &str) -> Result<Option<CassandraBackup>> {
        Ok(self.backup(name))
    }

    async fn replace_backup_status(&self, backup: &CassandraBackup) -> Result<CassandraBackup> {
        let name = backup.metadata.name.clone().unwrap_or_default();
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Conflict(name));
        }

        let mut state = self.state();
        state.resource_version += 1;
        let version = state.resource_version.to_string();
        let stored = state
            .backups
            .get_mut(&name)
            .ok_or_else(|| anyhow::anyhow!("backup {} not found", name))?;
        if stored.metadata.resource_version != backup.metadata.resource_version {
            return Err(Error::Conflict(name));
        }
        stored.status = backup.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }
}

//////////////////////////////////////////////////////////////////////////////
// NodeAgent /////////////////////////////////////////////////////////////////

/// A scripted node agent.
#[derive(Default)]
pub struct FakeAgent {
    name: String,
    /// The reported node state, `None` when unreachable.
    state: Mutex<Option<NodeState>>,
    /// Panic when queried for status.
    panics: bool,
    /// Refuse to start operations.
    refuses: bool,
    /// Scripted responses of `find_operation`, the last one repeats.
    polls: Mutex<VecDeque<Option<(OperationState, f32)>>>,
    started: Mutex<Vec<OperationRequest>>,
    decommissions: AtomicUsize,
    finds: AtomicUsize,
}

impl FakeAgent {
    pub fn new(name: &str, state: NodeState) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(Some(state)),
            ..Default::default()
        }
    }

    pub fn unreachable(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn panicking(name: &str) -> Self {
        Self {
            name: name.into(),
            panics: true,
            ..Default::default()
        }
    }

    pub fn refusing(name: &str) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(Some(NodeState::Normal)),
            refuses: true,
            ..Default::default()
        }
    }

    /// Script the responses of `find_operation`, `None` being a failed poll.
    pub fn with_polls(self, polls: Vec<Option<(OperationState, f32)>>) -> Self {
        *self.polls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = polls.into();
        self
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(state);
    }

    pub fn decommissions(&self) -> usize {
        self.decommissions.load(Ordering::SeqCst)
    }

    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<OperationRequest> {
        self.started.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn unreachable_error(&self) -> AgentError {
        AgentError::Status {
            code: 503,
            body: format!("{} unreachable", self.name),
        }
    }
}

#[async_trait]
impl NodeAgent for FakeAgent {
    fn id(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> std::result::Result<NodeState, AgentError> {
        if self.panics {
            panic!("agent {} panicked", self.name);
        }
        let state = *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.ok_or_else(|| self.unreachable_error())
    }

    async fn start_operation(&self, req: &OperationRequest) -> std::result::Result<String, AgentError> {
        if self.refuses {
            return Err(self.unreachable_error());
        }
        let mut started = self.started.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        started.push(req.clone());
        Ok(format!("{}-op-{}", self.name, started.len()))
    }

    async fn find_operation(&self, id: &str) -> std::result::Result<OperationRecord, AgentError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut polls = self.polls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if polls.len() > 1 {
                polls.pop_front().flatten()
            } else {
                polls.front().cloned().flatten()
            }
        };
        let (state, progress) = next.ok_or_else(|| self.unreachable_error())?;
        Ok(OperationRecord {
            id: id.into(),
            kind: OperationKind::Backup,
            state,
            progress,
        })
    }

    async fn decommission(&self) -> std::result::Result<(), AgentError> {
        if self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).is_none() {
            return Err(self.unreachable_error());
        }
        self.decommissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connects pods to registered fake agents; unknown pods get an unreachable agent.
#[derive(Default)]
pub struct FakeConnector {
    agents: Mutex<BTreeMap<String, Arc<FakeAgent>>>,
}

impl FakeConnector {
    pub fn add(&self, agent: FakeAgent) -> Arc<FakeAgent> {
        let agent = Arc::new(agent);
        self.agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(agent.name.clone(), agent.clone());
        agent
    }
}

impl AgentConnector for FakeConnector {
    fn connect(&self, pod: &PodInfo, _secure: bool) -> Arc<dyn NodeAgent> {
        let agents = self.agents.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match agents.get(&pod.name) {
            Some(agent) => agent.clone(),
            None => Arc::new(FakeAgent::unreachable(&pod.name)),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// EventSink /////////////////////////////////////////////////////////////////

/// An event recorded by `FakeEvents`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub subject: String,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

/// An `EventSink` which records all events.
#[derive(Default)]
pub struct FakeEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|event| event.reason == reason).collect()
    }
}

impl EventSink for FakeEvents {
    fn emit(&self, subject: ObjectReference, severity: Severity, reason: &str, message: String) {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(RecordedEvent {
            subject: subject.name.unwrap_or_default(),
            severity,
            reason: reason.into(),
            message,
        });
    }
}
