//! Builders of the K8s objects backing a datacenter.
//!
//! Every datacenter is backed by:
//! - one StatefulSet per rack, named `cassandra-{cluster}-{dc}-{rack}`;
//! - a headless "nodes" Service selecting all pods of the datacenter, used for discovery;
//! - a headless "seeds" Service selecting the first pod of each rack;
//! - one ConfigMap per rack holding the rack's `cassandra-rackdc.properties`.
//!
//! All objects carry the canonical labels of the operator and are owned by their datacenter, so
//! that K8s garbage collects them once the datacenter is deleted.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Service, ServicePort, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use crate::k8s::racks::RackPlan;
use crate::k8s::APP_NAME;
use cassandra_core::crd::{CassandraDataCenter, RequiredMetadata};

/// The canonical K8s label identifying the application.
const LABEL_K8S_APP_NAME: &str = "app.kubernetes.io/name";
/// The canonical K8s label identifying the manager of an object.
const LABEL_K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// The label K8s puts on StatefulSet pods holding the pod's ordinal.
const LABEL_K8S_POD_INDEX: &str = "apps.kubernetes.io/pod-index";
/// The label identifying the Cassandra cluster of an object.
pub const LABEL_CLUSTER: &str = "cassandraoperator.io/cluster";
/// The label identifying the datacenter of an object.
pub const LABEL_DATACENTER: &str = "cassandraoperator.io/datacenter";
/// The label identifying the rack of an object.
pub const LABEL_RACK: &str = "cassandraoperator.io/rack";

/// The pod container name of Cassandra.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
const CONTAINER_NAME_CASSANDRA: &str = "cassandra";
/// The pod container name of the node agent.
const CONTAINER_NAME_SIDECAR: &str = "sidecar";
/// The name of the data volume, shared by Cassandra and its agent.
const VOLUME_DATA: &str = "data";
/// The name of the rack config volume.
const VOLUME_RACK_CONFIG: &str = "rack-config";
/// The location where Cassandra keeps its data.
const CASSANDRA_DATA_PATH: &str = "/var/lib/cassandra";
/// The location where the rack config is mounted.
const RACK_CONFIG_PATH: &str = "/etc/cassandra-rack";
/// The file name of the rack config.
pub const RACK_CONFIG_FILE: &str = "cassandra-rackdc.properties";

/// The port used for inter-node communication.
const PORT_INTERNODE: i32 = 7000;
/// The port used by CQL clients.
const PORT_CQL: i32 = 9042;
/// The port used for JMX.
const PORT_JMX: i32 = 7199;

/// Set the canonical labels on the given label set.
pub fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert(LABEL_K8S_APP_NAME.into(), "cassandra".into());
    labels.insert(LABEL_K8S_MANAGED_BY.into(), APP_NAME.into());
}

/// The labels identifying all objects of a datacenter.
pub fn datacenter_labels(dc: &CassandraDataCenter) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    set_cannonical_labels(&mut labels);
    labels.insert(LABEL_CLUSTER.into(), dc.spec.cluster.clone());
    labels.insert(LABEL_DATACENTER.into(), dc.spec.datacenter.clone());
    labels
}

/// The labels identifying all objects of a rack.
pub fn rack_labels(dc: &CassandraDataCenter, rack: &str) -> BTreeMap<String, String> {
    let mut labels = datacenter_labels(dc);
    labels.insert(LABEL_RACK.into(), rack.into());
    labels
}

/// A label selector string matching all objects of a datacenter.
pub fn datacenter_selector(dc: &CassandraDataCenter) -> String {
    datacenter_labels(dc)
        .into_iter()
        .map(|(key, val)| format!("{}={}", key, val))
        .collect::<Vec<_>>()
        .join(",")
}

/// The name prefix of all objects of a datacenter.
pub fn base_name(dc: &CassandraDataCenter) -> String {
    format!("cassandra-{}-{}", dc.spec.cluster, dc.spec.datacenter).to_lowercase()
}

/// The name of the StatefulSet of a rack.
pub fn statefulset_name(dc: &CassandraDataCenter, rack: &str) -> String {
    format!("{}-{}", base_name(dc), rack.to_lowercase())
}

/// The name of the discovery Service of a datacenter.
pub fn nodes_service_name(dc: &CassandraDataCenter) -> String {
    format!("{}-nodes", base_name(dc))
}

/// The name of the seeds Service of a datacenter.
pub fn seeds_service_name(dc: &CassandraDataCenter) -> String {
    format!("{}-seeds", base_name(dc))
}

/// The name of the rack config of a rack.
pub fn rack_config_name(dc: &CassandraDataCenter, rack: &str) -> String {
    format!("{}-rack-config", statefulset_name(dc, rack))
}

/// The spec replicas of a StatefulSet.
pub fn spec_replicas(sts: &StatefulSet) -> u32 {
    sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1).max(0) as u32
}

/// The observed ready replicas of a StatefulSet.
pub fn ready_replicas(sts: &StatefulSet) -> u32 {
    sts.status.as_ref().and_then(|status| status.ready_replicas).unwrap_or(0).max(0) as u32
}

/// Build the metadata of an object owned by the given datacenter.
fn owned_meta(dc: &CassandraDataCenter, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(dc.namespace().into()),
        labels: Some(labels),
        owner_references: dc.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

fn service_ports() -> Vec<ServicePort> {
    [("internode", PORT_INTERNODE), ("cql", PORT_CQL)]
        .into_iter()
        .map(|(name, port)| ServicePort {
            name: Some(name.into()),
            port,
            protocol: Some("TCP".into()),
            target_port: Some(IntOrString::Int(port)),
            ..Default::default()
        })
        .collect()
}

/// Build the headless discovery Service of a datacenter.
pub fn build_nodes_service(dc: &CassandraDataCenter) -> Service {
    let mut service = Service {
        metadata: owned_meta(dc, nodes_service_name(dc), datacenter_labels(dc)),
        ..Default::default()
    };
    let spec = service.spec.get_or_insert_with(Default::default);
    spec.selector = Some(datacenter_labels(dc));
    spec.cluster_ip = Some("None".into());
    spec.type_ = Some("ClusterIP".into());
    // Nodes must find each other before they are ready.
    spec.publish_not_ready_addresses = Some(true);
    spec.ports = Some(service_ports());
    service
}

/// Build the headless seeds Service of a datacenter, selecting the first pod of every rack.
pub fn build_seeds_service(dc: &CassandraDataCenter) -> Service {
    let mut selector = datacenter_labels(dc);
    selector.insert(LABEL_K8S_POD_INDEX.into(), "0".into());
    let mut service = Service {
        metadata: owned_meta(dc, seeds_service_name(dc), datacenter_labels(dc)),
        ..Default::default()
    };
    let spec = service.spec.get_or_insert_with(Default::default);
    spec.selector = Some(selector);
    spec.cluster_ip = Some("None".into());
    spec.type_ = Some("ClusterIP".into());
    spec.publish_not_ready_addresses = Some(true);
    spec.ports = Some(service_ports());
    service
}

/// Build the rack config of a rack.
pub fn build_rack_config(dc: &CassandraDataCenter, rack: &str) -> ConfigMap {
    ConfigMap {
        metadata: owned_meta(dc, rack_config_name(dc, rack), rack_labels(dc, rack)),
        data: Some(maplit::btreemap! {
            RACK_CONFIG_FILE.to_string() => format!("dc={}\nrack={}\n", dc.spec.datacenter, rack),
        }),
        ..Default::default()
    }
}

fn env_value(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value),
        ..Default::default()
    }
}

fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

/// Build the StatefulSet of a rack.
#[tracing::instrument(level = "debug", skip(dc, rack), fields(rack = %rack.name))]
pub fn build_statefulset(dc: &CassandraDataCenter, rack: &RackPlan, sidecar_port: u16) -> StatefulSet {
    tracing::debug!(name = dc.name(), "building a new statefulset for rack");
    let labels = rack_labels(dc, &rack.name);
    let seeds = format!("{}.{}.svc", seeds_service_name(dc), dc.namespace());
    let pull_policy = dc.spec.image_pull_policy.clone().or_else(|| Some("IfNotPresent".into()));
    let scheme = if dc.spec.sidecar_secure { "HTTPS" } else { "HTTP" };

    let cassandra = Container {
        // NOTE WELL: do not change the name of this container. It will cause breaking changes.
        name: CONTAINER_NAME_CASSANDRA.into(),
        image: Some(dc.spec.cassandra_image.clone()),
        image_pull_policy: pull_policy.clone(),
        ports: Some(vec![
            container_port("internode", PORT_INTERNODE),
            container_port("cql", PORT_CQL),
            container_port("jmx", PORT_JMX),
        ]),
        env: Some(vec![
            env_value("CASSANDRA_CLUSTER_NAME", dc.spec.cluster.clone()),
            env_value("CASSANDRA_DC", dc.spec.datacenter.clone()),
            env_value("CASSANDRA_RACK", rack.name.clone()),
            env_value("CASSANDRA_ENDPOINT_SNITCH", "GossipingPropertyFileSnitch".into()),
            env_value("CASSANDRA_SEEDS", seeds),
            env_value("CASSANDRA_RACKDC_PROPERTIES", format!("{}/{}", RACK_CONFIG_PATH, RACK_CONFIG_FILE)),
            env_field("POD_NAME", "metadata.name"),
            env_field("POD_IP", "status.podIP"),
        ]),
        resources: dc.spec.resources.clone(),
        volume_mounts: Some(vec![
            VolumeMount {
                name: VOLUME_DATA.into(),
                mount_path: CASSANDRA_DATA_PATH.into(),
                ..Default::default()
            },
            VolumeMount {
                name: VOLUME_RACK_CONFIG.into(),
                mount_path: RACK_CONFIG_PATH.into(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    // Readiness is reported by the agent, which keeps serving once its node has been
    // decommissioned; a decommissioned node stays ready until its replica is removed.
    let sidecar = Container {
        name: CONTAINER_NAME_SIDECAR.into(),
        image: Some(dc.spec.sidecar_image.clone()),
        image_pull_policy: pull_policy,
        ports: Some(vec![container_port("http", sidecar_port as i32)]),
        env: Some(vec![
            env_value("SIDECAR_PORT", sidecar_port.to_string()),
            env_value("CASSANDRA_DATA_PATH", CASSANDRA_DATA_PATH.into()),
            env_field("POD_NAME", "metadata.name"),
            env_field("NAMESPACE", "metadata.namespace"),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: VOLUME_DATA.into(),
            mount_path: CASSANDRA_DATA_PATH.into(),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            initial_delay_seconds: Some(15),
            period_seconds: Some(10),
            http_get: Some(HTTPGetAction {
                path: Some("/status".into()),
                port: IntOrString::Int(sidecar_port as i32),
                scheme: Some(scheme.into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut sts = StatefulSet {
        metadata: owned_meta(dc, statefulset_name(dc, &rack.name), labels.clone()),
        ..Default::default()
    };
    let spec = sts.spec.get_or_insert_with(Default::default);
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: None,
    });
    spec.pod_management_policy = Some("OrderedReady".into());
    spec.service_name = nodes_service_name(dc);
    spec.replicas = Some(rack.replicas as i32);
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };
    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(120),
            node_selector: Some(rack.labels.clone()).filter(|labels| !labels.is_empty()),
            tolerations: Some(rack.tolerations.clone()).filter(|tolerations| !tolerations.is_empty()),
            containers: vec![cassandra, sidecar],
            volumes: Some(vec![Volume {
                name: VOLUME_RACK_CONFIG.into(),
                config_map: Some(ConfigMapVolumeSource {
                    name: rack_config_name(dc, &rack.name),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    };

    // Build volume claim templates.
    let claim = &dc.spec.data_volume_claim;
    spec.volume_claim_templates = Some(vec![PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(VOLUME_DATA.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: claim.access_modes.clone().or_else(|| Some(vec!["ReadWriteOnce".into()])),
            storage_class_name: claim.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(maplit::btreemap! {
                    "storage".into() => Quantity(claim.storage.clone()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }]);

    sts
}
