//! WordPress site manifests
//!
//! The deployment runs two containers in one pod: WordPress on PHP-FPM and an
//! nginx sidecar serving the same document root and forwarding PHP requests
//! over the shared network namespace.

use super::{labels, FIELD_MANAGER, LABEL_APP, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY};
use crate::site::SiteSpec;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, KeyToPath,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const APP_LABEL_VALUE: &str = "wordpress";

pub const WORDPRESS_CONTAINER: &str = "wordpress";
pub const NGINX_CONTAINER: &str = "nginx";

pub const DATA_VOLUME: &str = "wordpress-data";
pub const UPLOADS_VOLUME: &str = "uploads-ini";
pub const NGINX_VOLUME: &str = "nginx-conf";

/// Document root shared by both containers
pub const SHARED_MOUNT_PATH: &str = "/var/www/html";
pub const UPLOADS_MOUNT_PATH: &str = "/usr/local/etc/php/conf.d/uploads.ini";
pub const NGINX_CONF_MOUNT_PATH: &str = "/etc/nginx/conf.d";

pub const UPLOADS_KEY: &str = "uploads.ini";
pub const NGINX_CONF_KEY: &str = "default.conf";

pub const NGINX_PORT_NAME: &str = "nginx";
pub const NGINX_PORT: i32 = 80;

pub const SECRET_KEY_USER: &str = "user";
pub const SECRET_KEY_PASSWORD: &str = "password";
pub const SECRET_KEY_DB_NAME: &str = "db_name";

pub const ENV_DB_HOST: &str = "WORDPRESS_DB_HOST";
pub const ENV_DB_USER: &str = "WORDPRESS_DB_USER";
pub const ENV_DB_PASSWORD: &str = "WORDPRESS_DB_PASSWORD";
pub const ENV_DB_NAME: &str = "WORDPRESS_DB_NAME";

/// Secret-derived env vars and the secret key each one reads
pub const SECRET_ENV: [(&str, &str); 3] = [
    (ENV_DB_USER, SECRET_KEY_USER),
    (ENV_DB_PASSWORD, SECRET_KEY_PASSWORD),
    (ENV_DB_NAME, SECRET_KEY_DB_NAME),
];

/// kubelet mode for projected config map files when `defaultMode` is unset
pub const DEFAULT_CONFIG_MODE: i32 = 0o644;

pub const RECREATE: &str = "Recreate";

const DEFAULT_UPLOADS_INI: &str = "file_uploads = On
memory_limit = 256M
upload_max_filesize = 64M
post_max_size = 64M
max_execution_time = 300
";

const DEFAULT_NGINX_CONF: &str = r#"server {
    listen 80;
    server_name _;

    root /var/www/html;
    index index.php;

    client_max_body_size 64M;

    location / {
        try_files $uri $uri/ /index.php?$args;
    }

    location ~ \.php$ {
        try_files $uri =404;
        fastcgi_split_path_info ^(.+\.php)(/.+)$;
        fastcgi_pass 127.0.0.1:9000;
        fastcgi_index index.php;
        include fastcgi_params;
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        fastcgi_param PATH_INFO $fastcgi_path_info;
    }
}
"#;

/// Labels used by the deployment selector and the service
pub fn selector_labels(site: &SiteSpec) -> BTreeMap<String, String> {
    labels([(LABEL_APP, APP_LABEL_VALUE), (LABEL_INSTANCE, site.name.as_str())])
}

/// Pod template labels: the selector plus component and ownership labels
pub fn template_labels(site: &SiteSpec) -> BTreeMap<String, String> {
    let mut labels = selector_labels(site);
    labels.insert(LABEL_COMPONENT.to_string(), "frontend".to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string());
    labels
}

fn metadata(site: &SiteSpec, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(site.namespace()),
        labels: Some(template_labels(site)),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn data_mount() -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: SHARED_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

fn wordpress_container(site: &SiteSpec) -> Container {
    let secret = site.database_secret();
    Container {
        name: WORDPRESS_CONTAINER.to_string(),
        image: Some(site.wordpress_image.clone()),
        env: Some(vec![
            EnvVar {
                name: ENV_DB_HOST.to_string(),
                value: Some(site.database_host.clone()),
                ..Default::default()
            },
            secret_env(ENV_DB_USER, &secret, SECRET_KEY_USER),
            secret_env(ENV_DB_PASSWORD, &secret, SECRET_KEY_PASSWORD),
            secret_env(ENV_DB_NAME, &secret, SECRET_KEY_DB_NAME),
        ]),
        volume_mounts: Some(vec![
            data_mount(),
            VolumeMount {
                name: UPLOADS_VOLUME.to_string(),
                mount_path: UPLOADS_MOUNT_PATH.to_string(),
                sub_path: Some(UPLOADS_KEY.to_string()),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn nginx_container(site: &SiteSpec) -> Container {
    Container {
        name: NGINX_CONTAINER.to_string(),
        image: Some(site.nginx_image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some(NGINX_PORT_NAME.to_string()),
            container_port: NGINX_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            data_mount(),
            VolumeMount {
                name: NGINX_VOLUME.to_string(),
                mount_path: NGINX_CONF_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn volumes(site: &SiteSpec) -> Vec<Volume> {
    vec![
        Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: site.storage_claim(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: UPLOADS_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: site.uploads_config_map(),
                items: Some(vec![KeyToPath {
                    key: UPLOADS_KEY.to_string(),
                    path: UPLOADS_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: NGINX_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: site.nginx_config_map(),
                default_mode: Some(site.nginx_config_mode),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// Build the site deployment
pub fn deployment(site: &SiteSpec) -> Deployment {
    Deployment {
        metadata: metadata(site, site.name.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(site.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(site)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some(RECREATE.to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels(site)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![wordpress_container(site), nginx_container(site)],
                    volumes: Some(volumes(site)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service in front of the nginx port
pub fn service(site: &SiteSpec) -> Service {
    Service {
        metadata: metadata(site, site.name.clone()),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(site)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: NGINX_PORT,
                target_port: Some(IntOrString::String(NGINX_PORT_NAME.to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Config map with the PHP upload limits
pub fn uploads_config_map(site: &SiteSpec) -> ConfigMap {
    ConfigMap {
        metadata: metadata(site, site.uploads_config_map()),
        data: Some(labels([(UPLOADS_KEY, DEFAULT_UPLOADS_INI)])),
        ..Default::default()
    }
}

/// Config map with the nginx server block
pub fn nginx_config_map(site: &SiteSpec) -> ConfigMap {
    ConfigMap {
        metadata: metadata(site, site.nginx_config_map()),
        data: Some(labels([(NGINX_CONF_KEY, DEFAULT_NGINX_CONF)])),
        ..Default::default()
    }
}

/// ReadWriteOnce claim backing the document root
pub fn storage_claim(site: &SiteSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: metadata(site, site.storage_claim()),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(
                    [("storage".to_string(), Quantity(site.storage_size.clone()))]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Opaque secret with the database credentials
pub fn database_secret(site: &SiteSpec, user: &str, password: &str, db_name: &str) -> Secret {
    Secret {
        metadata: metadata(site, site.database_secret()),
        type_: Some("Opaque".to_string()),
        string_data: Some(labels([
            (SECRET_KEY_USER, user),
            (SECRET_KEY_PASSWORD, password),
            (SECRET_KEY_DB_NAME, db_name),
        ])),
        ..Default::default()
    }
}
