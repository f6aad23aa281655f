//! Wire models of the node agent HTTP API.
//!
//! Every Cassandra pod runs a sidecar agent next to the database process. The agent reports the
//! node's lifecycle state as seen by the database and runs administrative operations on behalf of
//! the operator. All payloads are JSON.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The default port of the node agent HTTP API.
pub const SIDECAR_PORT: u16 = 4567;

/// The lifecycle state of a Cassandra node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Starting,
    Normal,
    Joining,
    Leaving,
    Decommissioned,
    Moving,
    Draining,
    Drained,
    /// Not reported by the database: the node's agent could not be reached.
    Error,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Starting => "STARTING",
                Self::Normal => "NORMAL",
                Self::Joining => "JOINING",
                Self::Leaving => "LEAVING",
                Self::Decommissioned => "DECOMMISSIONED",
                Self::Moving => "MOVING",
                Self::Draining => "DRAINING",
                Self::Drained => "DRAINED",
                Self::Error => "ERROR",
            }
        )
    }
}

/// The kinds of long-running operations a node agent can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Decommission,
    Cleanup,
    Rebuild,
    Scrub,
    Upgradesstables,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Backup => "backup",
                Self::Decommission => "decommission",
                Self::Cleanup => "cleanup",
                Self::Rebuild => "rebuild",
                Self::Scrub => "scrub",
                Self::Upgradesstables => "upgradesstables",
            }
        )
    }
}

/// The state of an operation running on a node agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl OperationState {
    /// Check if this state is final; a terminal operation is never updated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Default for OperationState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Pending => "PENDING",
                Self::Running => "RUNNING",
                Self::Completed => "COMPLETED",
                Self::Failed => "FAILED",
                Self::Unknown => "UNKNOWN",
            }
        )
    }
}

/// Response body of `GET /status`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub node_state: NodeState,
}

/// Request body of `POST /operations`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OperationRequest {
    /// The kind of operation to start.
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Operation specific parameters, inlined into the request body.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl OperationRequest {
    /// Build a new request for the given kind of operation.
    pub fn new(kind: OperationKind, params: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { kind, params }
    }
}

/// An operation as reported by `GET /operations/{id}`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OperationRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default)]
    pub state: OperationState,
    /// Completion fraction in `[0, 1]`.
    #[serde(default)]
    pub progress: f32,
}
