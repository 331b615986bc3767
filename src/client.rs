//! Cluster client
//!
//! Wraps a `kube::Client` with the operations the CLI exposes. Every write is
//! either a create-if-absent (objects holding operator data: secrets, claims,
//! config maps) or a server-side apply (the deployment and service kwpm owns).

use crate::drift::drift;
use crate::error::{KwpmError, Result};
use crate::manifest::mariadb::{self, MariaDbSpec};
use crate::manifest::{self, wordpress, Manifest, FIELD_MANAGER};
use crate::preflight::{self, Inventory};
use crate::site::{SiteSpec, NAMESPACE_PREFIX};
use crate::validation;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info, warn};

/// Annotation bumped on the pod template to force a new rollout
pub const RESTARTED_AT_ANNOTATION: &str = "kwpm.io/restartedAt";

/// Result of applying a site deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    /// Live object differed at these JSON paths
    Updated(Vec<String>),
    Unchanged,
}

/// Database credentials written into a new site secret
#[derive(Debug, Clone)]
pub struct DbCredentials {
    pub user: String,
    pub password: String,
    pub db_name: String,
}

pub struct KwpmClient {
    client: Client,
    pv_base_path: String,
}

impl KwpmClient {
    /// Connect using the ambient kubeconfig or in-cluster service account
    pub async fn new(pv_base_path: impl ToString) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::from_client(client, pv_base_path))
    }

    pub fn from_client(client: Client, pv_base_path: impl ToString) -> Self {
        Self {
            client,
            pv_base_path: pv_base_path.to_string(),
        }
    }

    pub async fn namespaces(&self) -> Result<Vec<Namespace>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.list(&ListParams::default()).await?.items)
    }

    /// Namespaces whose name carries the `kwpm-` prefix
    pub async fn kwpm_namespaces(&self) -> Result<Vec<Namespace>> {
        Ok(self
            .namespaces()
            .await?
            .into_iter()
            .filter(|ns| ns.name_any().starts_with(NAMESPACE_PREFIX))
            .collect())
    }

    pub async fn is_mariadb_created(&self) -> Result<bool> {
        Ok(self
            .kwpm_namespaces()
            .await?
            .iter()
            .any(|ns| ns.name_any().ends_with("-mariadb")))
    }

    /// Create the shared MariaDB backend; fails if it already exists
    pub async fn create_mariadb_if_not_exists(
        &self,
        root_password: &str,
        node_hostname: &str,
    ) -> Result<()> {
        if self.is_mariadb_created().await? {
            return Err(KwpmError::AlreadyExists(
                "MariaDB deployment".to_string(),
            ));
        }

        let spec = MariaDbSpec {
            root_password: root_password.to_string(),
            node_hostname: node_hostname.to_string(),
            pv_base_path: self.pv_base_path.clone(),
        };
        info!(node = %node_hostname, path = %self.pv_base_path, "Creating MariaDB backend");

        for object in mariadb::manifests(&spec) {
            self.create(&object, mariadb::NAMESPACE).await?;
        }

        info!(namespace = mariadb::NAMESPACE, "MariaDB backend created");
        Ok(())
    }

    /// Delete the backend namespace and its cluster-scoped volume. Either
    /// one already being gone is not an error.
    pub async fn remove_mariadb(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        if !delete_if_present(&namespaces, mariadb::NAMESPACE).await? {
            debug!(namespace = mariadb::NAMESPACE, "Namespace already removed");
        }

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        if !delete_if_present(&volumes, mariadb::PV_NAME).await? {
            debug!(volume = mariadb::PV_NAME, "Persistent volume already removed");
        }

        info!(namespace = mariadb::NAMESPACE, "MariaDB backend removed");
        Ok(())
    }

    /// Snapshot the secrets, config maps and claims of a namespace
    pub async fn inventory(&self, namespace: &str) -> Result<Inventory> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default();

        let (secrets, config_maps, claims) = futures::try_join!(
            secrets.list(&lp),
            config_maps.list(&lp),
            claims.list(&lp)
        )?;
        Ok(Inventory::from_objects(
            &secrets.items,
            &config_maps.items,
            &claims.items,
        ))
    }

    /// Create the namespace, config maps, claim and (optionally) database
    /// secret of a site. Existing objects are left untouched.
    pub async fn provision_site(
        &self,
        site: &SiteSpec,
        credentials: Option<&DbCredentials>,
    ) -> Result<()> {
        let namespace = site.namespace();
        let mut objects = vec![
            Manifest::Namespace(manifest::namespace(&namespace)),
            Manifest::ConfigMap(wordpress::uploads_config_map(site)),
            Manifest::ConfigMap(wordpress::nginx_config_map(site)),
            Manifest::PersistentVolumeClaim(wordpress::storage_claim(site)),
        ];
        if let Some(c) = credentials {
            objects.push(Manifest::Secret(wordpress::database_secret(
                site,
                &c.user,
                &c.password,
                &c.db_name,
            )));
        }

        for object in &objects {
            self.create(object, &namespace).await?;
        }
        info!(site = %site.name, namespace = %namespace, "Site provisioned");
        Ok(())
    }

    /// Validate, preflight and server-side apply the site deployment and service
    pub async fn apply_site(&self, site: &SiteSpec) -> Result<ApplyOutcome> {
        let namespace = site.namespace();
        let desired = wordpress::deployment(site);
        validation::ensure_valid(&desired)?;

        let inventory = self.inventory(&namespace).await?;
        preflight::ensure_satisfied(&desired, &inventory)?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let outcome = match deployments.get_opt(&site.name).await? {
            None => ApplyOutcome::Created,
            Some(live) => {
                let paths = drift(&desired, &live)?;
                if paths.is_empty() {
                    ApplyOutcome::Unchanged
                } else {
                    ApplyOutcome::Updated(paths)
                }
            }
        };

        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        apply(&services, &site.name, &wordpress::service(site)).await?;

        match &outcome {
            ApplyOutcome::Unchanged => {
                info!(site = %site.name, "Deployment unchanged, skipping apply");
            }
            ApplyOutcome::Updated(paths) => {
                info!(site = %site.name, changed = ?paths, "Updating deployment");
                apply(&deployments, &site.name, &desired).await?;
            }
            ApplyOutcome::Created => {
                info!(site = %site.name, namespace = %namespace, "Creating deployment");
                apply(&deployments, &site.name, &desired).await?;
            }
        }
        Ok(outcome)
    }

    /// Delete the deployment and service. Claim, secret and config maps stay.
    pub async fn delete_site(&self, site: &SiteSpec) -> Result<()> {
        let namespace = site.namespace();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        delete_named(&deployments, &site.name).await?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = delete_named(&services, &site.name).await {
            warn!(site = %site.name, "Service cleanup failed: {}", e);
        }

        info!(site = %site.name, namespace = %namespace, "Site deleted");
        Ok(())
    }

    /// Trigger a new rollout by stamping the pod template
    pub async fn restart_site(&self, site: &SiteSpec) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &site.namespace());
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            (RESTARTED_AT_ANNOTATION): Utc::now().to_rfc3339()
                        }
                    }
                }
            }
        });
        match deployments
            .patch(&site.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                info!(site = %site.name, "Restart requested");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(KwpmError::NotFound(format!("deployment {}", site.name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, object: &Manifest, namespace: &str) -> Result<()> {
        let client = self.client.clone();
        match object {
            Manifest::Namespace(o) => create_if_absent(&Api::all(client), o).await,
            Manifest::PersistentVolume(o) => create_if_absent(&Api::all(client), o).await,
            Manifest::PersistentVolumeClaim(o) => {
                create_if_absent(&Api::namespaced(client, namespace), o).await
            }
            Manifest::Secret(o) => create_if_absent(&Api::namespaced(client, namespace), o).await,
            Manifest::ConfigMap(o) => {
                create_if_absent(&Api::namespaced(client, namespace), o).await
            }
            Manifest::Service(o) => create_if_absent(&Api::namespaced(client, namespace), o).await,
            Manifest::Deployment(o) => {
                create_if_absent(&Api::namespaced(client, namespace), o).await
            }
        }
    }
}

async fn create_if_absent<K>(api: &Api<K>, object: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let name = object.name_any();
    if api.get_opt(&name).await?.is_some() {
        debug!(kind = %K::kind(&Default::default()), name = %name, "Already present");
        return Ok(());
    }
    api.create(&PostParams::default(), object).await?;
    info!(kind = %K::kind(&Default::default()), name = %name, "Created");
    Ok(())
}

async fn apply<K>(api: &Api<K>, name: &str, object: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await?;
    Ok(())
}

/// Delete `name`, returning `false` when it did not exist
async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn delete_named<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            Err(KwpmError::NotFound(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::tests::server_shaped;
    use http::{Request, Response, StatusCode};
    use kube::client::Body;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<String>>>;

    /// Client answering every request from `routes`, recording "METHOD path"
    fn mock_client<F>(routes: F) -> (KwpmClient, Calls)
    where
        F: Fn(&str, &str) -> (StatusCode, Value) + Send + 'static,
    {
        let calls = Calls::default();
        let recorded = calls.clone();
        let service = tower::service_fn(move |req: Request<Body>| {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            recorded.lock().unwrap().push(format!("{} {}", method, path));
            let (status, body) = routes(&method, &path);
            async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&body).unwrap()))
                        .unwrap(),
                )
            }
        });
        let client = Client::new(service, "default");
        (KwpmClient::from_client(client, "/data/volumes/kwpm"), calls)
    }

    fn status(code: StatusCode) -> (StatusCode, Value) {
        (
            code,
            json!({
                "apiVersion": "v1",
                "kind": "Status",
                "metadata": {},
                "status": "Failure",
                "message": code.canonical_reason().unwrap_or_default(),
                "reason": if code == StatusCode::NOT_FOUND { "NotFound" } else { "InternalError" },
                "code": code.as_u16(),
            }),
        )
    }

    fn object<T: Serialize>(object: &T) -> (StatusCode, Value) {
        (StatusCode::OK, serde_json::to_value(object).unwrap())
    }

    fn list(kind: &str, items: Value) -> (StatusCode, Value) {
        (
            StatusCode::OK,
            json!({
                "apiVersion": "v1",
                "kind": kind,
                "metadata": {"resourceVersion": "48213"},
                "items": items,
            }),
        )
    }

    const NAMESPACE_PATH: &str = "/api/v1/namespaces/kwpm-mariadb";
    const PV_PATH: &str = "/api/v1/persistentvolumes/kwpm-mariadb-pv";

    #[tokio::test]
    async fn test_remove_mariadb_after_namespace_is_gone() {
        let (client, calls) = mock_client(|method, path| match (method, path) {
            ("DELETE", PV_PATH) => object(&json!({
                "apiVersion": "v1",
                "kind": "PersistentVolume",
                "metadata": {"name": mariadb::PV_NAME},
            })),
            _ => status(StatusCode::NOT_FOUND),
        });

        client.remove_mariadb().await.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                format!("DELETE {}", NAMESPACE_PATH),
                format!("DELETE {}", PV_PATH)
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_mariadb_when_nothing_is_left() {
        let (client, calls) = mock_client(|_, _| status(StatusCode::NOT_FOUND));
        client.remove_mariadb().await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_mariadb_reports_server_errors() {
        let (client, _) = mock_client(|method, path| match (method, path) {
            ("DELETE", PV_PATH) => status(StatusCode::INTERNAL_SERVER_ERROR),
            _ => status(StatusCode::NOT_FOUND),
        });
        assert!(matches!(
            client.remove_mariadb().await,
            Err(KwpmError::KubeApi(_))
        ));
    }

    const DEPLOYMENT_PATH: &str = "/apis/apps/v1/namespaces/kwpm-wordpress/deployments/wordpress";
    const SERVICE_PATH: &str = "/api/v1/namespaces/kwpm-wordpress/services/wordpress";

    /// Routes for a fully provisioned `wordpress` site; `live` answers the
    /// deployment GET
    fn site_routes(
        live: Option<Value>,
    ) -> impl Fn(&str, &str) -> (StatusCode, Value) + Send + 'static {
        let site = SiteSpec::default();
        let service = wordpress::service(&site);
        let deployment = wordpress::deployment(&site);
        move |method, path| match (method, path) {
            ("GET", "/api/v1/namespaces/kwpm-wordpress/secrets") => list(
                "SecretList",
                json!([{
                    "metadata": {"name": "wordpress-db"},
                    "data": {"user": "d3A=", "password": "czNjcjN0", "db_name": "d3A="},
                }]),
            ),
            ("GET", "/api/v1/namespaces/kwpm-wordpress/configmaps") => list(
                "ConfigMapList",
                json!([
                    {"metadata": {"name": "wordpress-uploads"}, "data": {"uploads.ini": ""}},
                    {"metadata": {"name": "wordpress-nginx"}, "data": {"default.conf": ""}},
                ]),
            ),
            ("GET", "/api/v1/namespaces/kwpm-wordpress/persistentvolumeclaims") => list(
                "PersistentVolumeClaimList",
                json!([{"metadata": {"name": "wordpress-pvc"}}]),
            ),
            ("GET", DEPLOYMENT_PATH) => match &live {
                Some(live) => (StatusCode::OK, live.clone()),
                None => status(StatusCode::NOT_FOUND),
            },
            ("PATCH", SERVICE_PATH) => object(&service),
            ("PATCH", DEPLOYMENT_PATH) => object(&deployment),
            _ => status(StatusCode::NOT_FOUND),
        }
    }

    #[tokio::test]
    async fn test_reapply_over_server_populated_deployment_is_unchanged() {
        let live = server_shaped(&wordpress::deployment(&SiteSpec::default()));
        let (client, calls) = mock_client(site_routes(Some(live)));

        let outcome = client.apply_site(&SiteSpec::default()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);

        let calls = calls.lock().unwrap();
        assert!(calls.contains(&format!("PATCH {}", SERVICE_PATH)));
        assert!(!calls.contains(&format!("PATCH {}", DEPLOYMENT_PATH)));
    }

    #[tokio::test]
    async fn test_apply_changed_image_updates_deployment() {
        let mut live = server_shaped(&wordpress::deployment(&SiteSpec::default()));
        live["spec"]["template"]["spec"]["containers"][1]["image"] = json!("nginx:1.25");
        let (client, calls) = mock_client(site_routes(Some(live)));

        let outcome = client.apply_site(&SiteSpec::default()).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Updated(vec![".spec.template.spec.containers[1].image".to_string()])
        );
        assert!(calls
            .lock()
            .unwrap()
            .contains(&format!("PATCH {}", DEPLOYMENT_PATH)));
    }

    #[tokio::test]
    async fn test_apply_creates_missing_deployment() {
        let (client, calls) = mock_client(site_routes(None));

        let outcome = client.apply_site(&SiteSpec::default()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);
        assert!(calls
            .lock()
            .unwrap()
            .contains(&format!("PATCH {}", DEPLOYMENT_PATH)));
    }

    #[tokio::test]
    async fn test_apply_without_secret_fails_before_writing() {
        let routes = site_routes(None);
        let (client, calls) = mock_client(move |method, path| match (method, path) {
            ("GET", "/api/v1/namespaces/kwpm-wordpress/secrets") => {
                list("SecretList", json!([]))
            }
            _ => routes(method, path),
        });

        let err = client.apply_site(&SiteSpec::default()).await.unwrap_err();
        assert!(matches!(err, KwpmError::MissingDependencies(_)));
        assert!(!calls.lock().unwrap().iter().any(|c| c.starts_with("PATCH")));
    }
}
