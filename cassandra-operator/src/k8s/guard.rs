//! Scaling guard.
//!
//! Every StatefulSet mutation must first pass `evaluate`. Requiring a fully converged & healthy
//! rack before each change keeps at most one topology change in flight.

use std::collections::BTreeMap;

use cassandra_core::sidecar::NodeState;

/// The outcome of a guard evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Verdict {
    /// True if the mutation may proceed.
    pub proceed: bool,
    /// Why the mutation may not proceed; empty when it may.
    pub reason: String,
    /// The agents whose state blocked the mutation.
    pub offending_states: Vec<(String, NodeState)>,
}

impl Verdict {
    fn reject(reason: String) -> Self {
        Self {
            proceed: false,
            reason,
            offending_states: vec![],
        }
    }
}

/// Decide whether a rack's StatefulSet may be scaled from `existing` to `desired` replicas.
///
/// - `ready` is the observed number of ready replicas of the StatefulSet.
/// - `all_running` is false if any pod of the datacenter is not in phase `Running`, in which
///   case `offending_pods` names those pods.
/// - `states` maps every node agent of the datacenter to its reported state.
pub fn evaluate(
    existing: u32, ready: u32, desired: u32, all_running: bool, offending_pods: &[String], states: &BTreeMap<String, NodeState>,
) -> Verdict {
    if ready != existing {
        return Verdict::reject(format!("waiting for replicas to become ready, {} of {} ready", ready, existing));
    }
    if !all_running {
        return Verdict::reject(format!("waiting for pods to be running: {}", offending_pods.join(", ")));
    }

    let scaling_up = desired > existing;
    let allowed = |state: &NodeState| match state {
        NodeState::Normal => true,
        NodeState::Decommissioned => !scaling_up,
        _ => false,
    };
    let offending_states: Vec<(String, NodeState)> = states
        .iter()
        .filter(|(_, state)| !allowed(state))
        .map(|(agent, state)| (agent.clone(), *state))
        .collect();
    if !offending_states.is_empty() {
        let listing: Vec<String> = offending_states.iter().map(|(agent, state)| format!("{}={}", agent, state)).collect();
        return Verdict {
            proceed: false,
            reason: format!("nodes not in an allowed state: {}", listing.join(", ")),
            offending_states,
        };
    }

    Verdict {
        proceed: true,
        ..Default::default()
    }
}
