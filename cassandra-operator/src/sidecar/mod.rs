//! Node agent client.
//!
//! Every Cassandra pod runs a sidecar agent which reports the node's lifecycle state and runs
//! long-running administrative operations. The operator only ever talks to agents through the
//! `NodeAgent` trait; `AgentConnector` maps a pod to its agent.

mod client;

use std::sync::Arc;

use async_trait::async_trait;

use crate::k8s::PodInfo;
use cassandra_core::sidecar::{NodeState, OperationRecord, OperationRequest};

pub use client::{HttpAgentConnector, SidecarClient};

/// Errors raised by node agent calls.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The pod has no IP address assigned yet.
    #[error("pod {0} has no address")]
    NoAddress(String),
    /// The request could not be sent or its response could not be read.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The agent answered with a non-success status code.
    #[error("unexpected response status {code}: {body}")]
    Status { code: u16, body: String },
    /// The agent accepted an operation without telling us its ID.
    #[error("operation created without an id")]
    MissingOperationId,
    /// The agent answered with a body we could not decode.
    #[error("error decoding response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The remote interface of a single node agent.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// The identity of this agent, which is the name of its pod.
    fn id(&self) -> &str;

    /// Query the lifecycle state of the node.
    async fn status(&self) -> Result<NodeState, AgentError>;

    /// Start an operation, returning its ID.
    async fn start_operation(&self, req: &OperationRequest) -> Result<String, AgentError>;

    /// Look up an operation by ID.
    async fn find_operation(&self, id: &str) -> Result<OperationRecord, AgentError>;

    /// Ask the node to leave the cluster.
    async fn decommission(&self) -> Result<(), AgentError>;
}

/// Builds node agent handles for pods.
pub trait AgentConnector: Send + Sync {
    /// Get a handle to the agent of the given pod.
    fn connect(&self, pod: &PodInfo, secure: bool) -> Arc<dyn NodeAgent>;
}
