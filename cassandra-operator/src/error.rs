//! Reconciliation error abstractions.

use cassandra_core::AppError;

use crate::sidecar::AgentError;

/// The result type of all reconciliation components.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised while reconciling a resource.
///
/// `kube::runtime::Controller` requires a `std::error::Error`, so anyhow is only used to carry
/// errors through the `Other` variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A K8s API call failed.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// An optimistic update lost its race and should be retried against a fresh copy.
    #[error("update conflict on {0}")]
    Conflict(String),
    /// The resource's spec is invalid.
    #[error(transparent)]
    App(#[from] AppError),
    /// The observed cluster is in a state this operator will not heal automatically.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// A node agent call failed.
    #[error("node agent {agent} error: {source}")]
    Agent {
        agent: String,
        #[source]
        source: AgentError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is an update conflict (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Check if this error is an invariant violation, which is never retried automatically.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// The label used for this error in metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube_error",
            Self::Conflict(_) => "conflict",
            Self::App(_) => "invalid_spec",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Agent { .. } => "agent_error",
            Self::Other(_) => "error",
        }
    }
}
