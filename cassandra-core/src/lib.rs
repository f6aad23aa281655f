pub mod crd;
pub mod error;
pub mod sidecar;

pub use error::AppError;

/// The canonical API group of all CRDs managed by the operator.
pub const API_GROUP: &str = "cassandraoperator.io";

/// Comma-separated list of canonical label selectors which match the
/// Cassandra Operator's labelling scheme.
pub const OPERATOR_LABEL_SELECTORS: &str = "app.kubernetes.io/managed-by=cassandra-operator";
