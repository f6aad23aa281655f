//! Rack planning.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;

use cassandra_core::crd::RackSpec;

/// The name of the rack synthesized for datacenters which declare no racks.
pub const DEFAULT_RACK: &str = "rack1";

/// The planned share of a datacenter's nodes placed in a rack.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RackPlan {
    pub name: String,
    pub replicas: u32,
    /// K8s node labels which pods of this rack must be scheduled onto.
    pub labels: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

/// Distribute the given number of nodes across the given racks.
///
/// Racks are ordered by name and the remainder of the division is handed out one node at a time
/// starting from the first rack, so the replicas of any two racks differ by at most one.
pub fn distribute(total: u32, racks: &[RackSpec]) -> Vec<RackPlan> {
    if racks.is_empty() {
        return vec![RackPlan {
            name: DEFAULT_RACK.into(),
            replicas: total,
            ..Default::default()
        }];
    }

    let mut sorted: Vec<&RackSpec> = racks.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let count = sorted.len() as u32;
    let (base, remainder) = (total / count, total % count);
    sorted
        .into_iter()
        .enumerate()
        .map(|(idx, rack)| RackPlan {
            name: rack.name.clone(),
            replicas: if (idx as u32) < remainder { base + 1 } else { base },
            labels: rack.labels.clone(),
            tolerations: rack.tolerations.clone(),
        })
        .collect()
}
