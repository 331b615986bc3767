//! Shared MariaDB backend
//!
//! One MariaDB instance serves every site. Its data lives on a local
//! PersistentVolume pinned to a single node.

use super::{labels, namespace, Manifest, FIELD_MANAGER, LABEL_APP, LABEL_MANAGED_BY};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, LocalVolumeSource, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec,
    PodTemplateSpec, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeNodeAffinity, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

pub const NAMESPACE: &str = "kwpm-mariadb";
pub const PV_NAME: &str = "kwpm-mariadb-pv";
pub const PVC_NAME: &str = "mariadb-pvc";
pub const SERVICE_NAME: &str = "mariadb";
pub const SECRET_NAME: &str = "mysql-pass";
pub const SECRET_KEY: &str = "password";
pub const STORAGE_CLASS: &str = "kwpm-local";
pub const IMAGE: &str = "mariadb:11";
pub const PORT: i32 = 3306;
pub const DEFAULT_PV_BASE_PATH: &str = "/data/volumes/kwpm";

const STORAGE_SIZE: &str = "20Gi";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Inputs for the backend manifests
#[derive(Debug, Clone)]
pub struct MariaDbSpec {
    pub root_password: String,
    /// Node that hosts the local volume
    pub node_hostname: String,
    pub pv_base_path: String,
}

fn selector() -> BTreeMap<String, String> {
    labels([(LABEL_APP, "mariadb")])
}

fn metadata(name: &str, namespaced: bool) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespaced.then(|| NAMESPACE.to_string()),
        labels: Some(labels([(LABEL_APP, "mariadb"), (LABEL_MANAGED_BY, FIELD_MANAGER)])),
        ..Default::default()
    }
}

fn storage_request() -> BTreeMap<String, Quantity> {
    [("storage".to_string(), Quantity(STORAGE_SIZE.to_string()))]
        .into_iter()
        .collect()
}

/// Local volume at `<pv_base_path>/mariadb`, only schedulable on `node_hostname`
pub fn persistent_volume(spec: &MariaDbSpec) -> PersistentVolume {
    PersistentVolume {
        metadata: metadata(PV_NAME, false),
        spec: Some(PersistentVolumeSpec {
            capacity: Some(storage_request()),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(STORAGE_CLASS.to_string()),
            local: Some(LocalVolumeSource {
                path: format!("{}/mariadb", spec.pv_base_path.trim_end_matches('/')),
                ..Default::default()
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: HOSTNAME_LABEL.to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![spec.node_hostname.clone()]),
                        }]),
                        ..Default::default()
                    }],
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn persistent_volume_claim() -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: metadata(PVC_NAME, true),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(STORAGE_CLASS.to_string()),
            volume_name: Some(PV_NAME.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(storage_request()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service() -> Service {
    Service {
        metadata: metadata(SERVICE_NAME, true),
        spec: Some(ServiceSpec {
            selector: Some(selector()),
            ports: Some(vec![ServicePort {
                name: Some("mysql".to_string()),
                port: PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn secret(spec: &MariaDbSpec) -> Secret {
    Secret {
        metadata: metadata(SECRET_NAME, true),
        type_: Some("Opaque".to_string()),
        string_data: Some(labels([(SECRET_KEY, spec.root_password.as_str())])),
        ..Default::default()
    }
}

pub fn deployment() -> Deployment {
    let container = Container {
        name: "mariadb".to_string(),
        image: Some(IMAGE.to_string()),
        env: Some(vec![EnvVar {
            name: "MARIADB_ROOT_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: SECRET_NAME.to_string(),
                    key: SECRET_KEY.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some("mysql".to_string()),
            container_port: PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "mariadb-data".to_string(),
            mount_path: "/var/lib/mysql".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata: metadata("mariadb", true),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "mariadb-data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: PVC_NAME.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Every backend object in creation order
pub fn manifests(spec: &MariaDbSpec) -> Vec<Manifest> {
    vec![
        Manifest::Namespace(namespace(NAMESPACE)),
        Manifest::PersistentVolume(persistent_volume(spec)),
        Manifest::PersistentVolumeClaim(persistent_volume_claim()),
        Manifest::Service(service()),
        Manifest::Secret(secret(spec)),
        Manifest::Deployment(deployment()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MariaDbSpec {
        MariaDbSpec {
            root_password: "password".to_string(),
            node_hostname: "node-1".to_string(),
            pv_base_path: "/data/volumes/kwpm/".to_string(),
        }
    }

    #[test]
    fn test_persistent_volume_path_and_affinity() {
        let pv = persistent_volume(&spec());
        let pv_spec = pv.spec.unwrap();
        assert_eq!(pv_spec.local.unwrap().path, "/data/volumes/kwpm/mariadb");
        let term = &pv_spec.node_affinity.unwrap().required.unwrap().node_selector_terms[0];
        let expr = &term.match_expressions.as_ref().unwrap()[0];
        assert_eq!(expr.key, "kubernetes.io/hostname");
        assert_eq!(expr.operator, "In");
        assert_eq!(expr.values, Some(vec!["node-1".to_string()]));
    }

    #[test]
    fn test_persistent_volume_is_cluster_scoped() {
        assert!(persistent_volume(&spec()).metadata.namespace.is_none());
        assert_eq!(
            persistent_volume_claim().metadata.namespace.as_deref(),
            Some(NAMESPACE)
        );
    }

    #[test]
    fn test_claim_binds_to_volume() {
        let claim = persistent_volume_claim();
        assert_eq!(claim.spec.unwrap().volume_name.as_deref(), Some(PV_NAME));
    }

    #[test]
    fn test_manifest_order() {
        let kinds: Vec<&str> = manifests(&spec()).iter().map(Manifest::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "Namespace",
                "PersistentVolume",
                "PersistentVolumeClaim",
                "Service",
                "Secret",
                "Deployment"
            ]
        );
    }

    #[test]
    fn test_secret_holds_root_password() {
        let secret = secret(&spec());
        assert_eq!(
            secret.string_data.unwrap().get("password").map(String::as_str),
            Some("password")
        );
    }
}
