//! CassandraDataCenter reconciliation.
//!
//! ## Overview
//! Each reconcile performs at most one topology mutation and then returns; the controller calls
//! back in on the next watch event, or after the fallback requeue interval. The steps are:
//!
//! 1. Fetch the datacenter. If it is gone there is nothing to do, its children carry owner
//!    references and are garbage collected by K8s.
//! 2. Ensure the child Services & rack ConfigMaps exist, as the pod template references them.
//! 3. Plan the replicas of each rack.
//! 4. Create the StatefulSets of racks which have none. If any was created, stop here.
//! 5. Pick the first rack whose StatefulSet does not match its planned replicas, poll the node
//!    agents of the datacenter, run the scaling guard, then scale up or take the next
//!    decommission step.
//!
//! The pod of a requested decommission is kept in the status until its StatefulSet is shrunk or
//! the datacenter converges.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::controller::Action;
use kube::Resource;

use crate::error::Result;
use crate::k8s::racks::{self, RackPlan};
use crate::k8s::{decommission, guard, resources, status, Deps, Severity};
use cassandra_core::crd::{CassandraDataCenter, CassandraDataCenterStatus, DataCenterPhase, RackReplicas, RequiredMetadata};

/// The outcome of a successful datacenter reconcile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The datacenter no longer exists.
    Deleted,
    /// StatefulSets were created for the named racks.
    Created { statefulsets: Vec<String> },
    /// Every rack matches its plan.
    Converged,
    /// A rack needs to change, but the datacenter is not ready for it.
    NotReady { reason: String },
    /// A node was asked to leave the cluster.
    DecommissionRequested { pod: String },
    /// A StatefulSet was scaled.
    Scaled { statefulset: String, from: u32, to: u32 },
}

impl Outcome {
    /// The controller action to take after this outcome.
    pub fn action(&self, requeue: Duration) -> Action {
        match self {
            Self::Deleted => Action::await_change(),
            // Agents are not watched, so every other outcome falls back to a timed requeue.
            _ => Action::requeue(requeue),
        }
    }

    /// The label used for this outcome in metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::Created { .. } => "created",
            Self::Converged => "converged",
            Self::NotReady { .. } => "not_ready",
            Self::DecommissionRequested { .. } => "decommission_requested",
            Self::Scaled { .. } => "scaled",
        }
    }
}

/// Reconcile the datacenter identified by the given key.
#[tracing::instrument(level = "debug", skip(deps))]
pub async fn reconcile(deps: &Deps, ns: &str, name: &str) -> Result<Outcome> {
    let dc = match deps.api.get_datacenter(ns, name).await? {
        Some(dc) if dc.metadata.deletion_timestamp.is_none() => dc,
        _ => {
            tracing::debug!("datacenter deleted, nothing to do");
            return Ok(Outcome::Deleted);
        }
    };
    dc.spec.validate()?;
    let pending = dc.status.as_ref().and_then(|status| status.decommissioning.clone());

    let plan = racks::distribute(dc.spec.nodes, &dc.spec.racks);
    ensure_children(deps, &dc, &plan).await?;

    // Ensure every planned rack has a StatefulSet.
    let mut sets: Vec<(&RackPlan, StatefulSet)> = Vec::with_capacity(plan.len());
    let mut created = vec![];
    for rack in plan.iter() {
        let sts_name = resources::statefulset_name(&dc, &rack.name);
        match deps.api.get_statefulset(ns, &sts_name).await? {
            Some(sts) => sets.push((rack, sts)),
            None => {
                let sts = resources::build_statefulset(&dc, rack, deps.config.sidecar_port);
                deps.api.create_statefulset(&sts).await?;
                created.push(sts_name);
            }
        }
    }
    warn_unplanned_racks(deps, &dc, &plan).await?;
    if !created.is_empty() {
        let message = format!("created StatefulSets {}", created.join(", "));
        deps.events.emit(dc.object_ref(&()), Severity::Normal, "Created", message.clone());
        update_status(deps, &dc, &plan, &sets, DataCenterPhase::Creating, Some(message), pending).await?;
        return Ok(Outcome::Created { statefulsets: created });
    }

    // Find the first rack which does not match its plan.
    let (rack, sts) = match sets.iter().find(|(rack, sts)| resources::spec_replicas(sts) != rack.replicas) {
        Some((rack, sts)) => (*rack, sts),
        None => {
            update_status(deps, &dc, &plan, &sets, DataCenterPhase::Running, None, None).await?;
            return Ok(Outcome::Converged);
        }
    };
    let sts_name = resources::statefulset_name(&dc, &rack.name);
    let (existing, ready, desired) = (resources::spec_replicas(sts), resources::ready_replicas(sts), rack.replicas);
    tracing::debug!(statefulset = %sts_name, existing, ready, desired, "rack does not match its plan");

    // Poll every node of the datacenter & check that the change may proceed.
    let pods = deps.api.list_pods(ns, &resources::datacenter_selector(&dc)).await?;
    let agents = pods.iter().map(|pod| deps.agents.connect(pod, dc.spec.sidecar_secure)).collect();
    let states = status::poll_all(agents).await;
    let offending_pods: Vec<String> = pods.iter().filter(|pod| !pod.running).map(|pod| pod.name.clone()).collect();
    let verdict = guard::evaluate(existing, ready, desired, offending_pods.is_empty(), &offending_pods, &states);
    if !verdict.proceed {
        tracing::info!(statefulset = %sts_name, reason = %verdict.reason, offending = ?verdict.offending_states, "rack not ready for scaling");
        update_status(deps, &dc, &plan, &sets, DataCenterPhase::Scaling, Some(verdict.reason.clone()), pending).await?;
        return Ok(Outcome::NotReady { reason: verdict.reason });
    }

    if desired > existing {
        deps.api.scale_statefulset(ns, &sts_name, desired).await?;
        metrics::counter!("cassandra_operator_scale_mutations_total", "direction" => "up").increment(1);
        let message = format!("scaled {} from {} to {} replicas", sts_name, existing, desired);
        deps.events.emit(dc.object_ref(&()), Severity::Normal, "ScaledUp", message.clone());
        update_status(deps, &dc, &plan, &sets, DataCenterPhase::Scaling, Some(message), pending).await?;
        return Ok(Outcome::Scaled {
            statefulset: sts_name,
            from: existing,
            to: desired,
        });
    }

    let outcome = match decommission::scale_down(deps, &dc, &sts_name, existing, desired, &pods, &states, pending.as_deref()).await {
        Ok(outcome) => outcome,
        Err(err) if err.is_invariant_violation() => {
            update_status(deps, &dc, &plan, &sets, DataCenterPhase::Blocked, Some(err.to_string()), pending).await?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    let (phase, message, decommissioning) = match &outcome {
        Outcome::DecommissionRequested { pod } => (DataCenterPhase::Decommissioning, format!("decommissioning node {}", pod), Some(pod.clone())),
        Outcome::NotReady { reason } => (DataCenterPhase::Decommissioning, reason.clone(), pending),
        _ => (DataCenterPhase::Scaling, format!("scaled {} from {} to {} replicas", sts_name, existing, existing - 1), None),
    };
    update_status(deps, &dc, &plan, &sets, phase, Some(message), decommissioning).await?;
    Ok(outcome)
}

/// Ensure the Services & ConfigMaps referenced by the pod template exist.
async fn ensure_children(deps: &Deps, dc: &CassandraDataCenter, plan: &[RackPlan]) -> Result<()> {
    deps.api.ensure_service(&resources::build_nodes_service(dc)).await?;
    deps.api.ensure_service(&resources::build_seeds_service(dc)).await?;
    for rack in plan {
        deps.api.ensure_config_map(&resources::build_rack_config(dc, &rack.name)).await?;
    }
    Ok(())
}

/// Log the StatefulSets of this datacenter which belong to no planned rack.
///
/// Removing racks is not supported, those StatefulSets are left alone.
async fn warn_unplanned_racks(deps: &Deps, dc: &CassandraDataCenter, plan: &[RackPlan]) -> Result<()> {
    let planned: BTreeSet<String> = plan.iter().map(|rack| resources::statefulset_name(dc, &rack.name)).collect();
    let existing = deps.api.list_statefulsets(dc.namespace(), &resources::datacenter_selector(dc)).await?;
    for sts in existing {
        let name = sts.metadata.name.unwrap_or_default();
        if !planned.contains(&name) {
            tracing::warn!(statefulset = %name, "StatefulSet belongs to no planned rack of its datacenter, leaving it untouched");
        }
    }
    Ok(())
}

/// Patch the status of the datacenter, if it changed.
async fn update_status(
    deps: &Deps, dc: &CassandraDataCenter, plan: &[RackPlan], sets: &[(&RackPlan, StatefulSet)], phase: DataCenterPhase, message: Option<String>,
    decommissioning: Option<String>,
) -> Result<()> {
    let status = CassandraDataCenterStatus {
        phase: Some(phase),
        replicas: sets.iter().map(|(_, sts)| resources::spec_replicas(sts)).sum(),
        ready_replicas: sets.iter().map(|(_, sts)| resources::ready_replicas(sts)).sum(),
        racks: plan
            .iter()
            .map(|rack| RackReplicas {
                name: rack.name.clone(),
                replicas: rack.replicas,
            })
            .collect(),
        message,
        decommissioning,
    };
    if dc.status.as_ref() == Some(&status) {
        return Ok(());
    }
    deps.api.patch_datacenter_status(dc, &status).await
}
