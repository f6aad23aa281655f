//! CassandraDataCenter CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// CRD spec for the CassandraDataCenter resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    status = "CassandraDataCenterStatus",
    group = "cassandraoperator.io",
    version = "v1alpha1",
    kind = "CassandraDataCenter",
    namespaced,
    derive = "PartialEq",
    shortname = "cdc",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"DataCenter","type":"string","jsonPath":".spec.datacenter"}"#,
    printcolumn = r#"{"name":"Nodes","type":"number","jsonPath":".spec.nodes"}"#,
    printcolumn = r#"{"name":"Ready","type":"number","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDataCenterSpec {
    /// The name of the Cassandra cluster this datacenter belongs to.
    pub cluster: String,
    /// The name of this datacenter within the Cassandra cluster.
    pub datacenter: String,
    /// The total number of Cassandra nodes of this datacenter, spread across its racks.
    ///
    /// This value can be scaled up and down. Scaling down decommissions nodes one at a time,
    /// always starting with the newest node of a rack.
    pub nodes: u32,
    /// The racks (fault domains) of this datacenter.
    ///
    /// When empty, all nodes are placed in a single rack.
    #[serde(default)]
    pub racks: Vec<RackSpec>,

    /// The Cassandra container image.
    pub cassandra_image: String,
    /// The node agent (sidecar) container image.
    pub sidecar_image: String,
    /// The image pull policy used for all containers.
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    /// Resource requirements of the Cassandra container.
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    /// The volume claim used for the Cassandra data directory.
    pub data_volume_claim: DataVolumeClaimSpec,
    /// Talk to node agents over HTTPS instead of plain HTTP.
    #[serde(default)]
    pub sidecar_secure: bool,
}

/// A named fault domain of a datacenter.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RackSpec {
    /// The name of the rack, unique within the datacenter.
    pub name: String,
    /// K8s node labels which pods of this rack must be scheduled onto.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Tolerations applied to pods of this rack.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

/// PVC settings for the data volume of each Cassandra node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeClaimSpec {
    /// The size of the volume, e.g. `100Gi`.
    pub storage: String,
    /// The storage class of the volume.
    #[serde(default)]
    pub storage_class: Option<String>,
    /// The access modes of the volume, defaults to `ReadWriteOnce`.
    #[serde(default)]
    pub access_modes: Option<Vec<String>>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDataCenterStatus {
    /// The current phase of the datacenter.
    #[serde(default)]
    pub phase: Option<DataCenterPhase>,
    /// The sum of spec replicas of all rack StatefulSets.
    #[serde(default)]
    pub replicas: u32,
    /// The sum of ready replicas of all rack StatefulSets.
    #[serde(default)]
    pub ready_replicas: u32,
    /// The planned replicas of each rack.
    #[serde(default)]
    pub racks: Vec<RackReplicas>,
    /// Human readable detail of the current phase.
    #[serde(default)]
    pub message: Option<String>,
    /// The pod whose node was asked to leave the cluster and has not reported `DECOMMISSIONED` yet.
    #[serde(default)]
    pub decommissioning: Option<String>,
}

/// The planned number of replicas of a rack.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RackReplicas {
    pub name: String,
    pub replicas: u32,
}

/// The phase of a datacenter's convergence.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum DataCenterPhase {
    /// Rack StatefulSets are being created.
    Creating,
    /// All racks match their planned replica counts.
    Running,
    /// A rack is being scaled; waiting for the cluster to converge.
    Scaling,
    /// A node has been asked to leave the cluster.
    Decommissioning,
    /// The datacenter is in a state which requires operator intervention.
    Blocked,
}

impl CassandraDataCenterSpec {
    /// Validate this spec.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.cluster.is_empty() || self.datacenter.is_empty() {
            return Err(AppError::InvalidInput("`cluster` and `datacenter` must not be empty".into()));
        }
        // Rack names are lowercased into the names of their K8s objects.
        let mut seen = BTreeSet::new();
        for rack in self.racks.iter() {
            if rack.name.is_empty() {
                return Err(AppError::InvalidInput("rack names must not be empty".into()));
            }
            let name = rack.name.to_lowercase();
            if !is_dns_label(&name) {
                return Err(AppError::InvalidInput(format!(
                    "rack name `{}` must consist of at most {} alphanumeric characters or '-', and start and end with an alphanumeric character",
                    rack.name, DNS_LABEL_MAX_LEN
                )));
            }
            if !seen.insert(name) {
                return Err(AppError::InvalidInput(format!("duplicate rack name `{}`", rack.name)));
            }
        }
        Ok(())
    }
}

/// The maximum length of a DNS-1123 label.
const DNS_LABEL_MAX_LEN: usize = 63;

/// Check that the given lowercase name is a DNS-1123 label.
fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= DNS_LABEL_MAX_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        }
        _ => false,
    }
}
