//! K8s API access.
//!
//! All reads & writes of reconciliation components go through the `ClusterApi` trait, which keeps
//! those components free of any direct dependency on a live K8s cluster.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;

use crate::error::{Error, Result};
use cassandra_core::crd::{CassandraBackup, CassandraDataCenter, CassandraDataCenterStatus, RequiredMetadata};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The K8s API operations used by the operator.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a datacenter, `None` if it does not exist.
    async fn get_datacenter(&self, ns: &str, name: &str) -> Result<Option<CassandraDataCenter>>;

    /// Patch the status of the given datacenter.
    async fn patch_datacenter_status(&self, dc: &CassandraDataCenter, status: &CassandraDataCenterStatus) -> Result<()>;

    /// Fetch a StatefulSet, `None` if it does not exist.
    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// List the StatefulSets matching the given label selector.
    async fn list_statefulsets(&self, ns: &str, selector: &str) -> Result<Vec<StatefulSet>>;

    /// Create the given StatefulSet.
    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet>;

    /// Set the spec replicas of a StatefulSet.
    async fn scale_statefulset(&self, ns: &str, name: &str, replicas: u32) -> Result<()>;

    /// Create the given Service unless a Service of the same name exists.
    async fn ensure_service(&self, service: &Service) -> Result<()>;

    /// Create the given ConfigMap unless a ConfigMap of the same name exists.
    async fn ensure_config_map(&self, cm: &ConfigMap) -> Result<()>;

    /// List the pods matching the given label selector.
    async fn list_pods(&self, ns: &str, selector: &str) -> Result<Vec<PodInfo>>;

    /// Fetch a backup, `None` if it does not exist.
    async fn get_backup(&self, ns: &str, name: &str) -> Result<Option<CassandraBackup>>;

    /// Replace the status of the given backup.
    ///
    /// The object's resource version is used for optimistic concurrency, a stale object yields
    /// an error for which `Error::is_conflict` holds.
    async fn replace_backup_status(&self, backup: &CassandraBackup) -> Result<CassandraBackup>;
}

/// The bits of a pod the operator cares about.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodInfo {
    /// The name of the pod, which is also the identity of its node agent.
    pub name: String,
    /// The IP of the pod, if assigned.
    pub ip: Option<String>,
    /// True if the pod is in phase `Running`.
    pub running: bool,
}

impl From<Pod> for PodInfo {
    fn from(pod: Pod) -> Self {
        let status = pod.status.unwrap_or_default();
        Self {
            name: pod.metadata.name.unwrap_or_default(),
            ip: status.pod_ip.filter(|ip| !ip.is_empty()),
            running: status.phase.as_deref() == Some("Running"),
        }
    }
}

/// A `ClusterApi` backed by a live K8s client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn get_opt<K>(&self, ns: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = self.api(ns);
        Ok(timeout(API_TIMEOUT, api.get_opt(name))
            .await
            .with_context(|| format!("timeout while fetching {} {}", K::kind(&()), name))??)
    }

    /// Create the given object if no object of the same name exists.
    async fn create_if_absent<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()> + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    {
        let (ns, name) = (obj.meta().namespace.as_deref().unwrap_or_default(), obj.meta().name.as_deref().unwrap_or_default());
        if self.get_opt::<K>(ns, name).await?.is_some() {
            return Ok(());
        }
        tracing::info!(%name, kind = %K::kind(&()), "creating child resource");
        let api: Api<K> = self.api(ns);
        let res = timeout(API_TIMEOUT, api.create(&PostParams::default(), obj))
            .await
            .with_context(|| format!("timeout while creating {} {}", K::kind(&()), name))?;
        match res {
            Ok(_) => Ok(()),
            // Lost a race with another writer, the object exists which is all we need.
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_datacenter(&self, ns: &str, name: &str) -> Result<Option<CassandraDataCenter>> {
        self.get_opt(ns, name).await
    }

    #[tracing::instrument(level = "debug", skip(self, dc, status), fields(name = dc.name()))]
    async fn patch_datacenter_status(&self, dc: &CassandraDataCenter, status: &CassandraDataCenterStatus) -> Result<()> {
        let api: Api<CassandraDataCenter> = self.api(dc.namespace());
        let patch = json!({ "status": status });
        timeout(API_TIMEOUT, api.patch_status(dc.name(), &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while patching datacenter status")??;
        Ok(())
    }

    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>> {
        self.get_opt(ns, name).await
    }

    async fn list_statefulsets(&self, ns: &str, selector: &str) -> Result<Vec<StatefulSet>> {
        let api: Api<StatefulSet> = self.api(ns);
        let list = timeout(API_TIMEOUT, api.list(&ListParams::default().labels(selector)))
            .await
            .context("timeout while listing StatefulSets")??;
        Ok(list.items)
    }

    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let (ns, name) = (sts.metadata.namespace.as_deref().unwrap_or_default(), sts.metadata.name.as_deref().unwrap_or_default());
        tracing::info!(%name, "creating StatefulSet");
        let api: Api<StatefulSet> = self.api(ns);
        Ok(timeout(API_TIMEOUT, api.create(&PostParams::default(), sts))
            .await
            .context("timeout while creating StatefulSet")??)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn scale_statefulset(&self, ns: &str, name: &str, replicas: u32) -> Result<()> {
        tracing::info!(%name, replicas, "scaling StatefulSet");
        let api: Api<StatefulSet> = self.api(ns);
        let params = PatchParams::default();
        let patch = json!({ "spec": { "replicas": replicas } });
        timeout(API_TIMEOUT, api.patch(name, &params, &Patch::Merge(&patch)))
            .await
            .context("timeout while scaling StatefulSet")??;
        Ok(())
    }

    async fn ensure_service(&self, service: &Service) -> Result<()> {
        self.create_if_absent(service).await
    }

    async fn ensure_config_map(&self, cm: &ConfigMap) -> Result<()> {
        self.create_if_absent(cm).await
    }

    async fn list_pods(&self, ns: &str, selector: &str) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = self.api(ns);
        let list = timeout(API_TIMEOUT, api.list(&ListParams::default().labels(selector)))
            .await
            .context("timeout while listing pods")??;
        Ok(list.items.into_iter().map(PodInfo::from).collect())
    }

    async fn get_backup(&self, ns: &str, name: &str) -> Result<Option<CassandraBackup>> {
        self.get_opt(ns, name).await
    }

    #[tracing::instrument(level = "trace", skip(self, backup), fields(name = backup.name()))]
    async fn replace_backup_status(&self, backup: &CassandraBackup) -> Result<CassandraBackup> {
        let api: Api<CassandraBackup> = self.api(backup.namespace());
        let data = serde_json::to_vec(backup).context("error serializing backup status")?;
        let res = timeout(API_TIMEOUT, api.replace_status(backup.name(), &PostParams::default(), data))
            .await
            .context("timeout while replacing backup status")?;
        res.map_err(|err| match err {
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(backup.name().into()),
            err => Error::Kube(err),
        })
    }
}
