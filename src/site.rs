//! Site configuration
//!
//! A `SiteSpec` holds every name and image a WordPress site manifest needs.
//! All fields are optional in the file; names derived from the site name fill
//! in whatever is left out.

use crate::error::{KwpmError, Result};
use crate::manifest::wordpress::DEFAULT_CONFIG_MODE;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix shared by every namespace kwpm manages
pub const NAMESPACE_PREFIX: &str = "kwpm-";

/// Configuration of one WordPress site
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SiteSpec {
    /// Site name, used for the deployment and as prefix for derived names
    #[serde(default = "default_name")]
    pub name: String,

    /// Target namespace (defaults to `kwpm-<name>`)
    #[serde(default)]
    pub namespace: Option<String>,

    /// WordPress PHP-FPM image
    #[serde(default = "default_wordpress_image")]
    pub wordpress_image: String,

    /// nginx sidecar image
    #[serde(default = "default_nginx_image")]
    pub nginx_image: String,

    /// Number of pod replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Database host passed to WordPress as a literal value
    #[serde(default = "default_database_host")]
    pub database_host: String,

    /// Secret holding the `user`, `password` and `db_name` keys
    #[serde(default)]
    pub database_secret: Option<String>,

    /// Persistent volume claim shared by both containers
    #[serde(default)]
    pub storage_claim: Option<String>,

    /// Requested size when kwpm creates the claim
    #[serde(default = "default_storage_size")]
    pub storage_size: String,

    /// Config map holding `uploads.ini`
    #[serde(default)]
    pub uploads_config_map: Option<String>,

    /// Config map holding the nginx server configuration
    #[serde(default)]
    pub nginx_config_map: Option<String>,

    /// File mode of the projected nginx configuration
    #[serde(default = "default_nginx_config_mode")]
    pub nginx_config_mode: i32,
}

impl Default for SiteSpec {
    fn default() -> Self {
        Self {
            name: default_name(),
            namespace: None,
            wordpress_image: default_wordpress_image(),
            nginx_image: default_nginx_image(),
            replicas: default_replicas(),
            database_host: default_database_host(),
            database_secret: None,
            storage_claim: None,
            storage_size: default_storage_size(),
            uploads_config_map: None,
            nginx_config_map: None,
            nginx_config_mode: default_nginx_config_mode(),
        }
    }
}

impl SiteSpec {
    /// Load a site from a YAML or JSON file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse a site from YAML (JSON is accepted as a YAML subset)
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let site: SiteSpec = if raw.trim().is_empty() {
            SiteSpec::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        site.validate()?;
        Ok(site)
    }

    /// Check that names are usable as Kubernetes object names
    pub fn validate(&self) -> Result<()> {
        // The name is also the Service name, which must start with a letter
        let leading_letter = self.name.starts_with(|c: char| c.is_ascii_lowercase());
        if !is_dns_label(&self.name) || !leading_letter {
            return Err(KwpmError::Configuration(format!(
                "site name '{}' must be a lowercase RFC 1035 label",
                self.name
            )));
        }
        if !is_dns_label(&self.namespace()) {
            return Err(KwpmError::Configuration(format!(
                "namespace '{}' must be a lowercase RFC 1123 label",
                self.namespace()
            )));
        }
        if self.replicas < 0 {
            return Err(KwpmError::Configuration(
                "replicas must not be negative".to_string(),
            ));
        }
        if !(0..=0o777).contains(&self.nginx_config_mode) {
            return Err(KwpmError::Configuration(format!(
                "nginx config mode {:o} is outside 0..=0777",
                self.nginx_config_mode
            )));
        }
        if self.nginx_config_mode == DEFAULT_CONFIG_MODE {
            return Err(KwpmError::Configuration(format!(
                "nginx config mode must differ from the default {:o}",
                DEFAULT_CONFIG_MODE
            )));
        }
        Ok(())
    }

    pub fn namespace(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| format!("{}{}", NAMESPACE_PREFIX, self.name))
    }

    pub fn database_secret(&self) -> String {
        self.database_secret
            .clone()
            .unwrap_or_else(|| format!("{}-db", self.name))
    }

    pub fn storage_claim(&self) -> String {
        self.storage_claim
            .clone()
            .unwrap_or_else(|| format!("{}-pvc", self.name))
    }

    pub fn uploads_config_map(&self) -> String {
        self.uploads_config_map
            .clone()
            .unwrap_or_else(|| format!("{}-uploads", self.name))
    }

    pub fn nginx_config_map(&self) -> String {
        self.nginx_config_map
            .clone()
            .unwrap_or_else(|| format!("{}-nginx", self.name))
    }
}

/// RFC 1123 label: at most 63 chars of `[a-z0-9-]`, alphanumeric at both ends
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

// Default value functions
fn default_name() -> String {
    "wordpress".to_string()
}

fn default_wordpress_image() -> String {
    "wordpress:php8.2-fpm".to_string()
}

fn default_nginx_image() -> String {
    "nginx:stable-alpine".to_string()
}

fn default_replicas() -> i32 {
    1
}

fn default_database_host() -> String {
    "mariadb.kwpm-mariadb.svc.cluster.local".to_string()
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

fn default_nginx_config_mode() -> i32 {
    0o440
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_spec_defaults() {
        let site: SiteSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(site, SiteSpec::default());
        assert_eq!(site.name, "wordpress");
        assert_eq!(site.replicas, 1);
        assert_eq!(site.nginx_config_mode, 0o440);
    }

    #[test]
    fn test_derived_names() {
        let site = SiteSpec::from_yaml("name: blog\n").unwrap();
        assert_eq!(site.namespace(), "kwpm-blog");
        assert_eq!(site.database_secret(), "blog-db");
        assert_eq!(site.storage_claim(), "blog-pvc");
        assert_eq!(site.uploads_config_map(), "blog-uploads");
        assert_eq!(site.nginx_config_map(), "blog-nginx");
    }

    #[test]
    fn test_explicit_names_win() {
        let site = SiteSpec::from_yaml(
            "name: blog\nnamespace: sites\ndatabaseSecret: shared-db\nstorageClaim: blog-data\n",
        )
        .unwrap();
        assert_eq!(site.namespace(), "sites");
        assert_eq!(site.database_secret(), "shared-db");
        assert_eq!(site.storage_claim(), "blog-data");
    }

    #[test]
    fn test_empty_file_is_default_site() {
        assert_eq!(SiteSpec::from_yaml("  \n").unwrap(), SiteSpec::default());
    }

    #[test]
    fn test_rejects_invalid_names() {
        assert!(SiteSpec::from_yaml("name: My_Blog\n").is_err());
        assert!(SiteSpec::from_yaml("name: -blog\n").is_err());
        assert!(SiteSpec::from_yaml("name: 1blog\n").is_err());
        assert!(SiteSpec::from_yaml("name: blog1\n").is_ok());
        assert!(SiteSpec::from_yaml("name: blog\nreplicas: -1\n").is_err());
        assert!(SiteSpec::from_yaml("name: blog\nnginxConfigMode: 4096\n").is_err());
        assert!(SiteSpec::from_yaml("name: blog\nnginxConfigMode: 420\n").is_err());
    }

    #[test]
    fn test_dns_label() {
        assert!(is_dns_label("kwpm-blog"));
        assert!(is_dns_label("a1"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("blog-"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}
