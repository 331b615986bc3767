//! Typed Kubernetes manifests
//!
//! - `wordpress`: the WordPress + nginx site deployment and its dependencies
//! - `mariadb`: the shared MariaDB backend
//! - `render`: YAML stream rendering and parsing

pub mod mariadb;
pub mod render;
pub mod wordpress;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use std::collections::BTreeMap;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kwpm";

pub const LABEL_APP: &str = "app";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Any object kwpm renders or applies
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    Namespace(Namespace),
    PersistentVolume(PersistentVolume),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Secret(Secret),
    ConfigMap(ConfigMap),
    Service(Service),
    Deployment(Deployment),
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Namespace(_) => "Namespace",
            Manifest::PersistentVolume(_) => "PersistentVolume",
            Manifest::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            Manifest::Secret(_) => "Secret",
            Manifest::ConfigMap(_) => "ConfigMap",
            Manifest::Service(_) => "Service",
            Manifest::Deployment(_) => "Deployment",
        }
    }
}

/// Namespace object carrying the managed-by label
pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels([(LABEL_MANAGED_BY, FIELD_MANAGER)])),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn labels<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_labelled() {
        let ns = namespace("kwpm-blog");
        assert_eq!(ns.metadata.name.as_deref(), Some("kwpm-blog"));
        assert_eq!(
            ns.metadata.labels.unwrap().get(LABEL_MANAGED_BY).map(String::as_str),
            Some("kwpm")
        );
    }

    #[test]
    fn test_manifest_serializes_as_inner_object() {
        let value = serde_json::to_value(Manifest::Namespace(namespace("kwpm-blog"))).unwrap();
        assert_eq!(value["kind"], "Namespace");
        assert_eq!(value["apiVersion"], "v1");
    }
}
