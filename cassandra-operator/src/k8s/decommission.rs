//! Decommission coordination.
//!
//! StatefulSets remove pods from the tail, so a rack shrinks in two steps: first the node with
//! the highest ordinal is asked to leave the Cassandra cluster, streaming its data to its peers.
//! Only once it reports `DECOMMISSIONED` is the StatefulSet shrunk by one replica. Both steps
//! happen in separate reconciles.
//!
//! A requested decommission is recorded in the datacenter's status. Until the node leaves its
//! `NORMAL` state, reconciles triggered in between wait on it instead of asking it again.

use std::collections::BTreeMap;

use kube::Resource;

use crate::error::{Error, Result};
use crate::k8s::datacenter::Outcome;
use crate::k8s::{Deps, PodInfo, Severity};
use cassandra_core::crd::{CassandraDataCenter, RequiredMetadata};
use cassandra_core::sidecar::NodeState;

/// The next step of a scale-down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Ask the given pod's node to leave the cluster.
    Decommission { pod: String },
    /// The given pod's node was already asked to leave the cluster, wait for it.
    Wait { pod: String },
    /// Shrink the StatefulSet to the given number of replicas.
    Shrink { replicas: u32 },
}

/// Decide the next scale-down step of a StatefulSet with `existing` spec replicas.
///
/// `states` holds the state of every node of the datacenter, `pending` the pod whose decommission
/// was last requested. Must only be called when `desired < existing` and the scaling guard passed.
pub fn decide(sts_name: &str, existing: u32, desired: u32, states: &BTreeMap<String, NodeState>, pending: Option<&str>) -> Result<Decision> {
    debug_assert!(desired < existing, "scale-down requires desired < existing");
    let newest = format!("{}-{}", sts_name, existing.saturating_sub(1));
    let decommissioned: Vec<&String> = states
        .iter()
        .filter(|(_, state)| **state == NodeState::Decommissioned)
        .map(|(agent, _)| agent)
        .collect();

    match decommissioned.as_slice() {
        [] if pending == Some(newest.as_str()) && states.contains_key(&newest) => Ok(Decision::Wait { pod: newest }),
        [] => Ok(Decision::Decommission { pod: newest }),
        [node] if **node == newest => Ok(Decision::Shrink { replicas: existing - 1 }),
        [node] => Err(Error::InvariantViolation(format!(
            "node {} is decommissioned but the newest node of {} is {}",
            node, sts_name, newest
        ))),
        nodes => Err(Error::InvariantViolation(format!(
            "{} nodes are decommissioned at once: {}",
            nodes.len(),
            nodes.iter().map(|node| node.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Run the next scale-down step of the given rack StatefulSet.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(level = "debug", skip(deps, dc, pods, states))]
pub async fn scale_down(
    deps: &Deps, dc: &CassandraDataCenter, sts_name: &str, existing: u32, desired: u32, pods: &[PodInfo], states: &BTreeMap<String, NodeState>,
    pending: Option<&str>,
) -> Result<Outcome> {
    match decide(sts_name, existing, desired, states, pending)? {
        Decision::Wait { pod } => {
            tracing::debug!(%pod, "decommission of newest node already requested, waiting");
            Ok(Outcome::NotReady {
                reason: format!("waiting for node {} to start decommissioning", pod),
            })
        }
        Decision::Decommission { pod } => {
            let target = pods
                .iter()
                .find(|info| info.name == pod)
                .ok_or_else(|| anyhow::anyhow!("pod {} to decommission was not found", pod))?;
            tracing::info!(%pod, "requesting decommission of newest node");
            let agent = deps.agents.connect(target, dc.spec.sidecar_secure);
            agent.decommission().await.map_err(|source| Error::Agent { agent: pod.clone(), source })?;

            metrics::counter!("cassandra_operator_decommissions_requested_total").increment(1);
            deps.events.emit(
                dc.object_ref(&()),
                Severity::Normal,
                "DecommissionRequested",
                format!("requested decommission of node {}", pod),
            );
            Ok(Outcome::DecommissionRequested { pod })
        }
        Decision::Shrink { replicas } => {
            deps.api.scale_statefulset(dc.namespace(), sts_name, replicas).await?;
            metrics::counter!("cassandra_operator_scale_mutations_total", "direction" => "down").increment(1);
            deps.events.emit(
                dc.object_ref(&()),
                Severity::Normal,
                "ScaledDown",
                format!("scaled {} from {} to {} replicas", sts_name, existing, replicas),
            );
            Ok(Outcome::Scaled {
                statefulset: sts_name.into(),
                from: existing,
                to: replicas,
            })
        }
    }
}
