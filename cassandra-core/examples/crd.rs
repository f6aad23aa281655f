//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use cassandra_core::crd::{CassandraBackup, CassandraDataCenter};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("deploy").join("crds");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating CRD dir {:?}", &crds_path))?;

    let datacenter = CassandraDataCenter::crd();
    let datacenter_yaml = serde_yaml::to_string(&datacenter).context("error serializing CassandraDataCenter CRD to yaml")?;
    std::fs::write(crds_path.join("cassandradatacenter.yaml"), &datacenter_yaml)
        .with_context(|| format!("error writing CassandraDataCenter CRD to {:?}", &crds_path))?;
    println!("CassandraDataCenter CRD written to {:?}", &crds_path);

    let backup = CassandraBackup::crd();
    let backup_yaml = serde_yaml::to_string(&backup).context("error serializing CassandraBackup CRD to yaml")?;
    std::fs::write(crds_path.join("cassandrabackup.yaml"), &backup_yaml).with_context(|| format!("error writing CassandraBackup CRD to {:?}", &crds_path))?;
    println!("CassandraBackup CRD written to {:?}", &crds_path);

    Ok(())
}
