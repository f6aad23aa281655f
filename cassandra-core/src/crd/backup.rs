//! CassandraBackup CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::sidecar::OperationState;

/// CRD spec for the CassandraBackup resource.
///
/// A backup snapshots every node of the target datacenter and uploads the snapshot to the given
/// storage location. Progress is reported per node in the resource's status.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    status = "CassandraBackupStatus",
    group = "cassandraoperator.io",
    version = "v1alpha1",
    kind = "CassandraBackup",
    namespaced,
    derive = "PartialEq",
    shortname = "cbackup",
    printcolumn = r#"{"name":"DataCenter","type":"string","jsonPath":".spec.datacenter"}"#,
    printcolumn = r#"{"name":"Snapshot","type":"string","jsonPath":".spec.snapshotTag"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.globalState"}"#,
    printcolumn = r#"{"name":"Progress","type":"number","jsonPath":".status.globalProgress"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraBackupSpec {
    /// The name of the CassandraDataCenter to back up.
    pub datacenter: String,
    /// The destination URI of the backup, e.g. `s3://bucket/cluster`.
    pub storage_location: String,
    /// The snapshot tag used on every node.
    pub snapshot_tag: String,
    /// Comma separated keyspaces to back up; all keyspaces when empty.
    #[serde(default)]
    pub keyspaces: Option<String>,
    /// A single table to back up, as `keyspace.table`.
    #[serde(default)]
    pub table: Option<String>,
    /// Expected duration of the upload, used by agents to throttle, e.g. `1 HOURS`.
    #[serde(default)]
    pub duration: Option<String>,
    /// Upload bandwidth cap, e.g. `10 MBPS`.
    #[serde(default)]
    pub bandwidth: Option<String>,
    /// Number of concurrent upload connections per node.
    #[serde(default)]
    pub concurrent_connections: Option<u32>,
}

/// The parameters sent to a node agent when starting a backup operation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupParams {
    pub storage_location: String,
    pub snapshot_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyspaces: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrent_connections: Option<u32>,
}

impl From<&CassandraBackupSpec> for BackupParams {
    fn from(spec: &CassandraBackupSpec) -> Self {
        Self {
            storage_location: spec.storage_location.clone(),
            snapshot_tag: spec.snapshot_tag.clone(),
            keyspaces: spec.keyspaces.clone(),
            table: spec.table.clone(),
            duration: spec.duration.clone(),
            bandwidth: spec.bandwidth.clone(),
            concurrent_connections: spec.concurrent_connections,
        }
    }
}

impl BackupParams {
    /// Render these params as the inlined fields of an operation request.
    pub fn into_map(self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Default::default(), // Structs always serialize to objects.
        }
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraBackupStatus {
    /// The backup status of each node on which the backup was started.
    #[serde(default)]
    pub nodes: Vec<BackupNodeStatus>,
    /// The state of the backup across all nodes.
    #[serde(default)]
    pub global_state: OperationState,
    /// The mean progress of all nodes.
    #[serde(default)]
    pub global_progress: f32,
}

/// The backup status of a single node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupNodeStatus {
    /// The pod name of the node.
    pub node: String,
    /// The ID of the operation on the node's agent.
    #[serde(default)]
    pub operation_id: Option<String>,
    pub state: OperationState,
    pub progress: f32,
}

impl CassandraBackupStatus {
    /// Get the status of the given node, if recorded.
    pub fn node(&self, node: &str) -> Option<&BackupNodeStatus> {
        self.nodes.iter().find(|status| status.node == node)
    }

    /// Record the state of a node, replacing any previous entry, and re-derive the global fields.
    pub fn set_node(&mut self, node: &str, state: OperationState, progress: f32) {
        match self.nodes.iter_mut().find(|status| status.node == node) {
            Some(entry) => {
                entry.state = state;
                entry.progress = progress;
            }
            None => self.nodes.push(BackupNodeStatus {
                node: node.into(),
                operation_id: None,
                state,
                progress,
            }),
        }
        self.derive_global();
    }

    /// Record the state of an operation running on a node, and re-derive the global fields.
    pub fn record_operation(&mut self, node: &str, operation_id: &str, state: OperationState, progress: f32) {
        self.set_node(node, state, progress);
        if let Some(entry) = self.nodes.iter_mut().find(|status| status.node == node) {
            entry.operation_id = Some(operation_id.into());
        }
    }

    /// Derive `global_state` & `global_progress` from the per-node entries.
    pub fn derive_global(&mut self) {
        let states = self.nodes.iter().map(|status| status.state);
        self.global_state = if self.nodes.is_empty() {
            OperationState::Pending
        } else if states.clone().any(|state| state == OperationState::Failed) {
            OperationState::Failed
        } else if states.clone().all(|state| state == OperationState::Completed) {
            OperationState::Completed
        } else if states.clone().any(|state| matches!(state, OperationState::Running | OperationState::Completed)) {
            OperationState::Running
        } else {
            OperationState::Pending
        };
        self.global_progress = if self.nodes.is_empty() {
            0.0
        } else {
            self.nodes.iter().map(|status| status.progress).sum::<f32>() / self.nodes.len() as f32
        };
    }

    /// Check if every recorded node has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|status| status.state.is_terminal())
    }
}
