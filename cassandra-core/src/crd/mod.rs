//! Cassandra operator CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod backup;
mod datacenter;

use kube::Resource;

pub use backup::{BackupNodeStatus, BackupParams, CassandraBackup, CassandraBackupSpec, CassandraBackupStatus};
pub use datacenter::{
    CassandraDataCenter, CassandraDataCenterSpec, CassandraDataCenterStatus, DataCenterPhase, DataVolumeClaimSpec, RackReplicas, RackSpec,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for CassandraDataCenter {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for CassandraBackup {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
