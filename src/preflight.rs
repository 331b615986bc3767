//! Dependency preflight
//!
//! A pod referencing a missing secret or config map never starts. Checking the
//! namespace before applying turns that into an immediate error instead of a
//! pod stuck in `CreateContainerConfigError`.

use crate::error::{KwpmError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Snapshot of the objects present in one namespace
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Secret name to its data keys
    pub secrets: BTreeMap<String, BTreeSet<String>>,
    /// Config map name to its data keys
    pub config_maps: BTreeMap<String, BTreeSet<String>>,
    pub claims: BTreeSet<String>,
}

impl Inventory {
    pub fn from_objects(
        secrets: &[Secret],
        config_maps: &[ConfigMap],
        claims: &[PersistentVolumeClaim],
    ) -> Self {
        let secrets = secrets
            .iter()
            .filter_map(|s| {
                let name = s.metadata.name.clone()?;
                let keys = s
                    .data
                    .iter()
                    .flat_map(|d| d.keys())
                    .chain(s.string_data.iter().flat_map(|d| d.keys()))
                    .cloned()
                    .collect();
                Some((name, keys))
            })
            .collect();
        let config_maps = config_maps
            .iter()
            .filter_map(|c| {
                let name = c.metadata.name.clone()?;
                let keys = c
                    .data
                    .iter()
                    .flat_map(|d| d.keys())
                    .chain(c.binary_data.iter().flat_map(|d| d.keys()))
                    .cloned()
                    .collect();
                Some((name, keys))
            })
            .collect();
        let claims = claims
            .iter()
            .filter_map(|c| c.metadata.name.clone())
            .collect();
        Self {
            secrets,
            config_maps,
            claims,
        }
    }
}

/// A dependency the deployment needs but the namespace lacks
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Missing {
    Secret(String),
    SecretKey { secret: String, key: String },
    ConfigMap(String),
    ConfigMapKey { config_map: String, key: String },
    Claim(String),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Secret(name) => write!(f, "secret {}", name),
            Missing::SecretKey { secret, key } => write!(f, "key '{}' in secret {}", key, secret),
            Missing::ConfigMap(name) => write!(f, "config map {}", name),
            Missing::ConfigMapKey { config_map, key } => {
                write!(f, "key '{}' in config map {}", key, config_map)
            }
            Missing::Claim(name) => write!(f, "persistent volume claim {}", name),
        }
    }
}

/// List every non-optional dependency of `deployment` absent from `inventory`
pub fn check(deployment: &Deployment, inventory: &Inventory) -> Vec<Missing> {
    let mut missing = BTreeSet::new();
    let Some(pod) = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
    else {
        return Vec::new();
    };

    let selectors = pod
        .containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .filter_map(|e| e.value_from.as_ref()?.secret_key_ref.as_ref())
        .filter(|s| s.optional != Some(true));
    for selector in selectors {
        match inventory.secrets.get(&selector.name) {
            None => {
                missing.insert(Missing::Secret(selector.name.clone()));
            }
            Some(keys) if !keys.contains(&selector.key) => {
                missing.insert(Missing::SecretKey {
                    secret: selector.name.clone(),
                    key: selector.key.clone(),
                });
            }
            Some(_) => {}
        }
    }

    for volume in pod.volumes.iter().flatten() {
        if let Some(claim) = &volume.persistent_volume_claim {
            if !inventory.claims.contains(&claim.claim_name) {
                missing.insert(Missing::Claim(claim.claim_name.clone()));
            }
        }
        let Some(source) = volume.config_map.as_ref().filter(|c| c.optional != Some(true))
        else {
            continue;
        };
        match inventory.config_maps.get(&source.name) {
            None => {
                missing.insert(Missing::ConfigMap(source.name.clone()));
            }
            Some(keys) => {
                for item in source.items.iter().flatten() {
                    if !keys.contains(&item.key) {
                        missing.insert(Missing::ConfigMapKey {
                            config_map: source.name.clone(),
                            key: item.key.clone(),
                        });
                    }
                }
            }
        }
    }

    missing.into_iter().collect()
}

/// `check` as a `Result`
pub fn ensure_satisfied(deployment: &Deployment, inventory: &Inventory) -> Result<()> {
    let missing = check(deployment, inventory);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(KwpmError::MissingDependencies(
            missing.iter().map(ToString::to_string).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::wordpress;
    use crate::site::SiteSpec;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn complete_inventory(site: &SiteSpec) -> Inventory {
        Inventory::from_objects(
            &[wordpress::database_secret(site, "wp", "pw", "wordpress")],
            &[
                wordpress::uploads_config_map(site),
                wordpress::nginx_config_map(site),
            ],
            &[wordpress::storage_claim(site)],
        )
    }

    #[test]
    fn test_inventory_from_objects() {
        let site = SiteSpec::default();
        let inventory = complete_inventory(&site);
        assert_eq!(
            inventory.secrets[&site.database_secret()],
            keys(&["db_name", "password", "user"])
        );
        assert_eq!(
            inventory.config_maps[&site.uploads_config_map()],
            keys(&["uploads.ini"])
        );
        assert!(inventory.claims.contains(&site.storage_claim()));
    }

    #[test]
    fn test_complete_namespace_passes() {
        let site = SiteSpec::default();
        let deployment = wordpress::deployment(&site);
        assert!(check(&deployment, &complete_inventory(&site)).is_empty());
        assert!(ensure_satisfied(&deployment, &complete_inventory(&site)).is_ok());
    }

    #[test]
    fn test_missing_secret_fails() {
        let site = SiteSpec::default();
        let mut inventory = complete_inventory(&site);
        inventory.secrets.clear();
        assert_eq!(
            check(&wordpress::deployment(&site), &inventory),
            vec![Missing::Secret(site.database_secret())]
        );
    }

    #[test]
    fn test_missing_secret_key_fails() {
        let site = SiteSpec::default();
        let mut inventory = complete_inventory(&site);
        inventory
            .secrets
            .insert(site.database_secret(), keys(&["user", "password"]));
        assert_eq!(
            check(&wordpress::deployment(&site), &inventory),
            vec![Missing::SecretKey {
                secret: site.database_secret(),
                key: "db_name".to_string(),
            }]
        );
    }

    #[test]
    fn test_missing_config_maps_and_claim_fail() {
        let site = SiteSpec::default();
        let mut inventory = complete_inventory(&site);
        inventory.config_maps.clear();
        inventory.claims.clear();
        let err = ensure_satisfied(&wordpress::deployment(&site), &inventory).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("config map wordpress-uploads"));
        assert!(message.contains("config map wordpress-nginx"));
        assert!(message.contains("persistent volume claim wordpress-pvc"));
    }

    #[test]
    fn test_missing_uploads_key_fails() {
        let site = SiteSpec::default();
        let mut inventory = complete_inventory(&site);
        inventory
            .config_maps
            .insert(site.uploads_config_map(), keys(&["php.ini"]));
        assert_eq!(
            check(&wordpress::deployment(&site), &inventory),
            vec![Missing::ConfigMapKey {
                config_map: site.uploads_config_map(),
                key: "uploads.ini".to_string(),
            }]
        );
    }
}
