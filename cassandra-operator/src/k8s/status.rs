//! Node status aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::sidecar::NodeAgent;
use cassandra_core::sidecar::NodeState;

/// Query the state of every given node agent concurrently.
///
/// Waits for every query to finish. An agent which can not be queried is reported as
/// `NodeState::Error`, which never fails the aggregate. Workers report to a single collector
/// over a channel; agents the collector never heard from (a worker panicked) are reported as
/// `NodeState::Error` as well.
#[tracing::instrument(level = "debug", skip(agents), fields(agents = agents.len()))]
pub async fn poll_all(agents: Vec<Arc<dyn NodeAgent>>) -> BTreeMap<String, NodeState> {
    let ids: Vec<String> = agents.iter().map(|agent| agent.id().to_string()).collect();
    let (tx, mut rx) = mpsc::channel(agents.len().max(1));
    for agent in agents {
        let tx = tx.clone();
        tokio::spawn(async move {
            let state = match agent.status().await {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(error = %err, agent = agent.id(), "error querying node agent status");
                    NodeState::Error
                }
            };
            let _ = tx.send((agent.id().to_string(), state)).await;
        });
    }
    drop(tx); // Collection ends once every worker is done.

    let mut states = BTreeMap::new();
    while let Some((id, state)) = rx.recv().await {
        states.insert(id, state);
    }
    for id in ids {
        states.entry(id).or_insert(NodeState::Error);
    }
    states
}
