//! YAML stream rendering

use super::Manifest;
use crate::error::{KwpmError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use serde::Deserialize;

/// Render manifests as one `---` separated YAML stream
pub fn to_yaml(manifests: &[Manifest]) -> Result<String> {
    let mut out = String::new();
    for (i, manifest) in manifests.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(manifest)?);
    }
    Ok(out)
}

/// Read the first Deployment out of a YAML stream
pub fn parse_deployment(raw: &str) -> Result<Deployment> {
    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.get("kind").and_then(serde_yaml::Value::as_str) == Some("Deployment") {
            return Ok(serde_yaml::from_value(value)?);
        }
    }
    Err(KwpmError::NotFound(
        "no Deployment document in input".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::wordpress;
    use crate::site::SiteSpec;

    #[test]
    fn test_rendered_deployment_parses_back() {
        let site = SiteSpec::default();
        let deployment = wordpress::deployment(&site);
        let yaml = to_yaml(&[
            Manifest::Service(wordpress::service(&site)),
            Manifest::Deployment(deployment.clone()),
        ])
        .unwrap();

        assert!(yaml.contains("\n---\n"));
        assert!(yaml.contains("apiVersion: apps/v1"));
        assert!(yaml.contains("kind: Deployment"));
        assert_eq!(parse_deployment(&yaml).unwrap(), deployment);
    }

    #[test]
    fn test_parse_without_deployment_fails() {
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n";
        assert!(matches!(
            parse_deployment(yaml),
            Err(KwpmError::NotFound(_))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        assert!(parse_deployment("kind: Deployment\nspec: [").is_err());
    }
}
