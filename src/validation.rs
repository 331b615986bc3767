//! Offline checks of a site deployment
//!
//! These are the properties the orchestrator either rejects outright (selector
//! mismatch) or silently accepts while producing a broken site (containers
//! disagreeing on the shared document root, a missing database variable).
//! Containers are matched by name first, then by what they carry: the
//! application sets `WORDPRESS_DB_HOST`, the proxy exposes the `nginx` port.

use crate::error::{KwpmError, Result};
use crate::manifest::wordpress::{
    DEFAULT_CONFIG_MODE, ENV_DB_HOST, NGINX_CONF_MOUNT_PATH, NGINX_CONTAINER, NGINX_PORT,
    NGINX_PORT_NAME, RECREATE, SECRET_ENV, SHARED_MOUNT_PATH, UPLOADS_MOUNT_PATH,
    WORDPRESS_CONTAINER,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PodSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A broken invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    MissingSpec(&'static str),
    /// Selector label or expression not satisfied by the pod template labels
    SelectorMismatch { key: String },
    MissingContainer(&'static str),
    /// No volume in the pod is backed by a persistent volume claim
    NoPersistentVolume,
    /// A claim volume is not mounted by every container
    SharedVolumeNotMounted { volume: String, container: String },
    /// Containers mount the same claim volume at different paths
    SharedMountPathMismatch { volume: String, paths: Vec<String> },
    MissingMount { container: String, path: &'static str },
    MountNotReadOnly { container: String, path: &'static str },
    WrongVolumeSource {
        container: String,
        path: &'static str,
        expected: &'static str,
    },
    /// `uploads.ini` is mounted as a directory instead of a single file
    UploadsNotSingleFile,
    /// nginx configuration projected with the kubelet default file mode
    DefaultConfigMode { volume: String },
    MissingProxyPort,
    MissingEnv(&'static str),
    EnvNotLiteral(&'static str),
    EnvWrongKey {
        name: &'static str,
        expected: &'static str,
    },
    /// Secret-derived env vars point at more than one secret
    MultipleSecrets(Vec<String>),
    /// Two env vars read the same secret key
    DuplicateSecretKey(String),
    UnexpectedStrategy(String),
    UndeclaredVolume { container: String, volume: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingSpec(what) => write!(f, "{} is not set", what),
            Violation::SelectorMismatch { key } => {
                write!(f, "selector on '{}' does not match the pod template", key)
            }
            Violation::MissingContainer(name) => write!(f, "no {} container", name),
            Violation::NoPersistentVolume => {
                write!(f, "no volume is backed by a persistent volume claim")
            }
            Violation::SharedVolumeNotMounted { volume, container } => {
                write!(f, "container '{}' does not mount volume '{}'", container, volume)
            }
            Violation::SharedMountPathMismatch { volume, paths } => write!(
                f,
                "volume '{}' is mounted at different paths: {}",
                volume,
                paths.join(", ")
            ),
            Violation::MissingMount { container, path } => {
                write!(f, "container '{}' has nothing mounted at {}", container, path)
            }
            Violation::MountNotReadOnly { container, path } => {
                write!(f, "{} in container '{}' must be read-only", path, container)
            }
            Violation::WrongVolumeSource {
                container,
                path,
                expected,
            } => write!(
                f,
                "{} in container '{}' must be backed by a {}",
                path, container, expected
            ),
            Violation::UploadsNotSingleFile => {
                write!(f, "{} must be mounted with a subPath", UPLOADS_MOUNT_PATH)
            }
            Violation::DefaultConfigMode { volume } => write!(
                f,
                "volume '{}' must set a defaultMode other than {:o}",
                volume, DEFAULT_CONFIG_MODE
            ),
            Violation::MissingProxyPort => write!(
                f,
                "proxy container does not expose port {} named '{}'",
                NGINX_PORT, NGINX_PORT_NAME
            ),
            Violation::MissingEnv(name) => write!(f, "env var {} is not set", name),
            Violation::EnvNotLiteral(name) => write!(f, "env var {} must be a literal value", name),
            Violation::EnvWrongKey { name, expected } => write!(
                f,
                "env var {} must read key '{}' of the database secret",
                name, expected
            ),
            Violation::MultipleSecrets(names) => {
                write!(f, "env vars reference several secrets: {}", names.join(", "))
            }
            Violation::DuplicateSecretKey(key) => {
                write!(f, "secret key '{}' is read by more than one env var", key)
            }
            Violation::UnexpectedStrategy(kind) => {
                write!(f, "update strategy is '{}', expected '{}'", kind, RECREATE)
            }
            Violation::UndeclaredVolume { container, volume } => write!(
                f,
                "container '{}' mounts undeclared volume '{}'",
                container, volume
            ),
        }
    }
}

/// Collect every violation in `deployment`
pub fn validate(deployment: &Deployment) -> Vec<Violation> {
    let Some(spec) = deployment.spec.as_ref() else {
        return vec![Violation::MissingSpec("spec")];
    };
    let mut violations = Vec::new();

    let template_labels = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    violations.extend(check_selector(&spec.selector, &template_labels));

    let strategy = spec
        .strategy
        .as_ref()
        .and_then(|s| s.type_.clone())
        .unwrap_or_else(|| "RollingUpdate".to_string());
    if strategy != RECREATE {
        violations.push(Violation::UnexpectedStrategy(strategy));
    }

    let Some(pod) = spec.template.spec.as_ref() else {
        violations.push(Violation::MissingSpec("pod template spec"));
        return violations;
    };
    violations.extend(check_declared_volumes(pod));
    violations.extend(check_shared_mounts(pod));

    let app = find_container(pod, WORDPRESS_CONTAINER, |c| {
        c.env.iter().flatten().any(|e| e.name == ENV_DB_HOST)
    });
    let proxy = find_container(pod, NGINX_CONTAINER, |c| {
        c.ports
            .iter()
            .flatten()
            .any(|p| p.name.as_deref() == Some(NGINX_PORT_NAME))
    });

    match app {
        Some(app) => {
            violations.extend(check_app_mounts(pod, app));
            violations.extend(check_app_env(app));
        }
        None => violations.push(Violation::MissingContainer("application")),
    }
    match proxy {
        Some(proxy) => violations.extend(check_proxy(pod, proxy)),
        None => violations.push(Violation::MissingContainer("proxy")),
    }
    violations.extend(check_secret_env(pod));

    violations
}

/// `validate` as a `Result`, for callers that stop on the first bad manifest
pub fn ensure_valid(deployment: &Deployment) -> Result<()> {
    let violations = validate(deployment);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(KwpmError::InvalidManifest(
            violations.iter().map(ToString::to_string).collect(),
        ))
    }
}

fn check_selector(
    selector: &LabelSelector,
    template: &BTreeMap<String, String>,
) -> Vec<Violation> {
    let labels = selector.match_labels.as_ref().filter(|l| !l.is_empty());
    let expressions = selector
        .match_expressions
        .as_ref()
        .filter(|e| !e.is_empty());
    if labels.is_none() && expressions.is_none() {
        return vec![Violation::MissingSpec("selector")];
    }

    let mut violations: Vec<Violation> = labels
        .into_iter()
        .flatten()
        .filter(|(k, v)| template.get(*k) != Some(*v))
        .map(|(k, _)| Violation::SelectorMismatch { key: k.clone() })
        .collect();
    violations.extend(
        expressions
            .into_iter()
            .flatten()
            .filter(|e| !expression_matches(e, template))
            .map(|e| Violation::SelectorMismatch { key: e.key.clone() }),
    );
    violations
}

fn expression_matches(
    expr: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> bool {
    let value = labels.get(&expr.key);
    let values = expr.values.as_deref().unwrap_or_default();
    match expr.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.map_or(true, |v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

fn find_container<'a>(
    pod: &'a PodSpec,
    name: &str,
    carries: impl Fn(&Container) -> bool,
) -> Option<&'a Container> {
    pod.containers
        .iter()
        .find(|c| c.name == name)
        .or_else(|| pod.containers.iter().find(|c| carries(c)))
}

fn mount_at<'a>(container: &'a Container, path: &str) -> Option<&'a VolumeMount> {
    container
        .volume_mounts
        .iter()
        .flatten()
        .find(|m| m.mount_path == path)
}

fn volume<'a>(pod: &'a PodSpec, name: &str) -> Option<&'a Volume> {
    pod.volumes.iter().flatten().find(|v| v.name == name)
}

fn check_declared_volumes(pod: &PodSpec) -> Vec<Violation> {
    let declared: BTreeSet<&str> = pod
        .volumes
        .iter()
        .flatten()
        .map(|v| v.name.as_str())
        .collect();
    pod.containers
        .iter()
        .flat_map(|c| {
            c.volume_mounts
                .iter()
                .flatten()
                .filter(|m| !declared.contains(m.name.as_str()))
                .map(|m| Violation::UndeclaredVolume {
                    container: c.name.clone(),
                    volume: m.name.clone(),
                })
        })
        .collect()
}

/// At least one claim volume, each mounted by every container at one path
fn check_shared_mounts(pod: &PodSpec) -> Vec<Violation> {
    let claim_volumes: Vec<&Volume> = pod
        .volumes
        .iter()
        .flatten()
        .filter(|v| v.persistent_volume_claim.is_some())
        .collect();
    if claim_volumes.is_empty() {
        return vec![Violation::NoPersistentVolume];
    }

    let mut violations = Vec::new();
    for volume in claim_volumes {
        let mut paths = BTreeSet::new();
        for container in &pod.containers {
            let mounts: Vec<&str> = container
                .volume_mounts
                .iter()
                .flatten()
                .filter(|m| m.name == volume.name)
                .map(|m| m.mount_path.as_str())
                .collect();
            if mounts.is_empty() {
                violations.push(Violation::SharedVolumeNotMounted {
                    volume: volume.name.clone(),
                    container: container.name.clone(),
                });
            }
            paths.extend(mounts);
        }
        if paths.len() > 1 {
            violations.push(Violation::SharedMountPathMismatch {
                volume: volume.name.clone(),
                paths: paths.into_iter().map(str::to_string).collect(),
            });
        }
    }
    violations
}

#[derive(Clone, Copy)]
enum Source {
    Claim,
    ConfigMap,
}

impl Source {
    fn matches(self, volume: &Volume) -> bool {
        match self {
            Source::Claim => volume.persistent_volume_claim.is_some(),
            Source::ConfigMap => volume.config_map.is_some(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Source::Claim => "persistent volume claim",
            Source::ConfigMap => "config map",
        }
    }
}

/// Check one required mount; returns the mount when it exists
fn check_mount<'a>(
    pod: &PodSpec,
    container: &'a Container,
    path: &'static str,
    source: Source,
    read_only: bool,
    violations: &mut Vec<Violation>,
) -> Option<&'a VolumeMount> {
    let Some(mount) = mount_at(container, path) else {
        violations.push(Violation::MissingMount {
            container: container.name.clone(),
            path,
        });
        return None;
    };
    if read_only && mount.read_only != Some(true) {
        violations.push(Violation::MountNotReadOnly {
            container: container.name.clone(),
            path,
        });
    }
    if !volume(pod, &mount.name).is_some_and(|v| source.matches(v)) {
        violations.push(Violation::WrongVolumeSource {
            container: container.name.clone(),
            path,
            expected: source.name(),
        });
    }
    Some(mount)
}

fn check_app_mounts(pod: &PodSpec, app: &Container) -> Vec<Violation> {
    let mut violations = Vec::new();
    check_mount(pod, app, SHARED_MOUNT_PATH, Source::Claim, false, &mut violations);
    let uploads = check_mount(
        pod,
        app,
        UPLOADS_MOUNT_PATH,
        Source::ConfigMap,
        true,
        &mut violations,
    );
    if uploads.is_some_and(|m| m.sub_path.as_deref().unwrap_or_default().is_empty()) {
        violations.push(Violation::UploadsNotSingleFile);
    }
    violations
}

fn check_proxy(pod: &PodSpec, proxy: &Container) -> Vec<Violation> {
    let mut violations = Vec::new();
    check_mount(pod, proxy, SHARED_MOUNT_PATH, Source::Claim, false, &mut violations);
    let conf = check_mount(
        pod,
        proxy,
        NGINX_CONF_MOUNT_PATH,
        Source::ConfigMap,
        true,
        &mut violations,
    );
    if let Some(mount) = conf {
        let mode = volume(pod, &mount.name)
            .and_then(|v| v.config_map.as_ref())
            .map(|c| c.default_mode.unwrap_or(DEFAULT_CONFIG_MODE));
        if mode == Some(DEFAULT_CONFIG_MODE) {
            violations.push(Violation::DefaultConfigMode {
                volume: mount.name.clone(),
            });
        }
    }

    let exposes_port = proxy.ports.iter().flatten().any(|p| {
        p.container_port == NGINX_PORT && p.name.as_deref() == Some(NGINX_PORT_NAME)
    });
    if !exposes_port {
        violations.push(Violation::MissingProxyPort);
    }
    violations
}

/// Host is a literal; user, password and database name read their own keys
fn check_app_env(app: &Container) -> Vec<Violation> {
    let env = |name: &str| app.env.iter().flatten().find(|e| e.name == name);
    let mut violations = Vec::new();

    match env(ENV_DB_HOST) {
        None => violations.push(Violation::MissingEnv(ENV_DB_HOST)),
        Some(e) if e.value.is_none() || e.value_from.is_some() => {
            violations.push(Violation::EnvNotLiteral(ENV_DB_HOST))
        }
        Some(_) => {}
    }

    for (name, expected) in SECRET_ENV {
        let Some(var) = env(name) else {
            violations.push(Violation::MissingEnv(name));
            continue;
        };
        let key = var
            .value_from
            .as_ref()
            .and_then(|s| s.secret_key_ref.as_ref())
            .map(|s| s.key.as_str());
        if key != Some(expected) {
            violations.push(Violation::EnvWrongKey { name, expected });
        }
    }
    violations
}

fn check_secret_env(pod: &PodSpec) -> Vec<Violation> {
    let mut secrets = BTreeSet::new();
    let mut keys = BTreeSet::new();
    let mut violations = Vec::new();

    let selectors = pod
        .containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .filter_map(|e| e.value_from.as_ref()?.secret_key_ref.as_ref());

    for selector in selectors {
        secrets.insert(selector.name.clone());
        if !keys.insert(selector.key.clone()) {
            violations.push(Violation::DuplicateSecretKey(selector.key.clone()));
        }
    }
    if secrets.len() > 1 {
        violations.push(Violation::MultipleSecrets(secrets.into_iter().collect()));
    }
    violations
}
