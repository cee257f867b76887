//! kube-rs backed applier and schema probe
//!
//! Every app is applied with server-side apply, one document at a time in
//! manifest order. The objects applied under an app are recorded in a
//! labelled ConfigMap so that `delete` and `list` work per app without
//! scanning the cluster.
//!
//! `delete` returns only once every object is gone. Finalizers keep objects
//! terminating after the API call, and applying over a terminating object
//! loses it as soon as the finalizer clears.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::template::{parse_documents, LABEL_MANAGED_BY, MANAGED_BY};
use crate::Error;

use super::{ApplyCause, ApplyError, DeployedApp, ManifestApplier, SchemaProbe};

/// Label marking an app record ConfigMap
pub const APP_RECORD_LABEL: &str = "runnerset.dev/app-record";

/// Field manager for server-side apply
const FIELD_MANAGER: &str = "runnerset";
/// Namespace app records are kept in
const DEFAULT_RECORD_NAMESPACE: &str = "default";
/// Prefix of app record ConfigMap names
const RECORD_PREFIX: &str = "runnerset-app-";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default budget for deleted objects to disappear
pub const DEFAULT_DELETION_TIMEOUT: Duration = Duration::from_secs(120);
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Build a client from kubeconfig contents, or from the environment when None
pub async fn client_from_kubeconfig(kubeconfig: Option<&str>) -> Result<Client, Error> {
    let unreachable_err =
        |message: String| Error::from(ApplyError::new("cluster", ApplyCause::ClusterUnreachable, message));

    let mut config = match kubeconfig {
        Some(yaml) => {
            let kubeconfig = Kubeconfig::from_yaml(yaml)
                .map_err(|e| unreachable_err(format!("failed to parse kubeconfig: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| unreachable_err(format!("failed to load kubeconfig: {e}")))?
        }
        None => Config::infer()
            .await
            .map_err(|e| unreachable_err(format!("failed to infer config: {e}")))?,
    };
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config).map_err(|e| unreachable_err(format!("failed to create client: {e}")))
}

/// Classify a kube error for the given app
fn apply_error(app: &str, context: &str, err: kube::Error) -> Error {
    let cause = match &err {
        kube::Error::Api(response) if response.code == 409 => ApplyCause::AlreadyExists,
        kube::Error::Api(response) if response.code == 404 => ApplyCause::NotFound,
        kube::Error::HyperError(_) | kube::Error::Service(_) => ApplyCause::ClusterUnreachable,
        _ => ApplyCause::Other,
    };
    ApplyError::new(app, cause, format!("{context}: {err}")).into()
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// One object applied under an app
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct AppObject {
    api_version: String,
    kind: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
}

impl AppObject {
    fn from_document(app: &str, doc: &serde_json::Value) -> Result<Self, Error> {
        let field = |pointer: &str| doc.pointer(pointer).and_then(|v| v.as_str());
        let missing = |what: &str| {
            Error::from(ApplyError::new(
                app,
                ApplyCause::Other,
                format!("manifest document is missing {what}"),
            ))
        };

        Ok(Self {
            api_version: field("/apiVersion").ok_or_else(|| missing("apiVersion"))?.to_string(),
            kind: field("/kind").ok_or_else(|| missing("kind"))?.to_string(),
            name: field("/metadata/name").ok_or_else(|| missing("metadata.name"))?.to_string(),
            namespace: field("/metadata/namespace").map(str::to_string),
        })
    }

    fn api_resource(&self) -> ApiResource {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        ApiResource {
            group,
            version,
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            plural: pluralize_kind(&self.kind),
        }
    }

    fn api(&self, client: &Client) -> Api<DynamicObject> {
        let resource = self.api_resource();
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
            None => Api::all_with(client.clone(), &resource),
        }
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Lowercase plural resource name for a kind
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// True while `found` is still the object deleted with `uid`
///
/// A different uid under the same name is a new object, so the deleted
/// one is gone.
fn still_terminating(found: Option<&DynamicObject>, uid: Option<&str>) -> bool {
    match (found, uid) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(object), Some(uid)) => object.metadata.uid.as_deref() == Some(uid),
    }
}

/// ManifestApplier over kube-rs server-side apply
pub struct KubeApplier {
    client: Client,
    record_namespace: String,
    deletion_timeout: Duration,
    deletion_poll: Duration,
}

impl KubeApplier {
    /// Create an applier keeping app records in the `default` namespace
    pub fn new(client: Client) -> Self {
        Self {
            client,
            record_namespace: DEFAULT_RECORD_NAMESPACE.to_string(),
            deletion_timeout: DEFAULT_DELETION_TIMEOUT,
            deletion_poll: DELETION_POLL_INTERVAL,
        }
    }

    /// Override how long `delete` waits for objects to disappear
    pub fn with_deletion_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.deletion_poll = poll_interval;
        self.deletion_timeout = timeout;
        self
    }

    /// Keep app records in another namespace
    pub fn with_record_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.record_namespace = namespace.into();
        self
    }

    fn records(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.record_namespace)
    }

    fn record_name(app: &str) -> String {
        format!("{RECORD_PREFIX}{app}")
    }

    async fn write_record(&self, app: &str, objects: &[AppObject]) -> Result<(), Error> {
        let primary_kind = objects.last().map(|o| o.kind.clone()).unwrap_or_default();
        let resources = serde_json::to_string(objects)
            .map_err(|e| Error::serialization(format!("app record for '{app}': {e}")))?;

        let record = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": Self::record_name(app),
                "namespace": self.record_namespace,
                "labels": {
                    APP_RECORD_LABEL: "true",
                    LABEL_MANAGED_BY: MANAGED_BY,
                },
            },
            "data": {
                "app": app,
                "kind": primary_kind,
                "resources": resources,
            },
        });

        self.records()
            .patch(
                &Self::record_name(app),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&record),
            )
            .await
            .map_err(|e| apply_error(app, "failed to write app record", e))?;
        Ok(())
    }

    /// Poll until the deleted object is gone or the deletion budget runs out
    async fn wait_until_gone(&self, app: &str, object: &AppObject, uid: Option<&str>) -> Result<(), Error> {
        let api = object.api(&self.client);
        let start = tokio::time::Instant::now();
        loop {
            let found = api
                .get_opt(&object.name)
                .await
                .map_err(|e| apply_error(app, &format!("failed to check {}", object.describe()), e))?;
            if !still_terminating(found.as_ref(), uid) {
                debug!(app, object = %object.describe(), "Object gone");
                return Ok(());
            }
            if start.elapsed() >= self.deletion_timeout {
                return Err(ApplyError::new(
                    app,
                    ApplyCause::Other,
                    format!(
                        "{} still terminating after {:?}",
                        object.describe(),
                        self.deletion_timeout
                    ),
                )
                .into());
            }
            debug!(app, object = %object.describe(), "Object still terminating");
            tokio::time::sleep(self.deletion_poll).await;
        }
    }

    async fn read_record(&self, app: &str) -> Result<Option<Vec<AppObject>>, Error> {
        let record = self
            .records()
            .get_opt(&Self::record_name(app))
            .await
            .map_err(|e| apply_error(app, "failed to read app record", e))?;

        let Some(record) = record else {
            return Ok(None);
        };
        let resources = record
            .data
            .as_ref()
            .and_then(|data| data.get("resources"))
            .map(String::as_str)
            .unwrap_or("[]");
        let objects = serde_json::from_str(resources)
            .map_err(|e| Error::serialization(format!("app record for '{app}': {e}")))?;
        Ok(Some(objects))
    }
}

#[async_trait]
impl ManifestApplier for KubeApplier {
    #[instrument(skip(self, manifest), fields(bytes = manifest.len()))]
    async fn apply(&self, app: &str, manifest: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(manifest)
            .map_err(|e| Error::serialization(format!("manifest for '{app}' is not UTF-8: {e}")))?;
        let documents = parse_documents(text, app)?;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut objects = Vec::with_capacity(documents.len());
        for doc in &documents {
            let object = AppObject::from_document(app, doc)?;
            object
                .api(&self.client)
                .patch(&object.name, &params, &Patch::Apply(doc))
                .await
                .map_err(|e| apply_error(app, &format!("failed to apply {}", object.describe()), e))?;
            debug!(app, object = %object.describe(), "Applied object");
            objects.push(object);
        }

        self.write_record(app, &objects).await?;
        info!(app, objects = objects.len(), "Applied app");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, app: &str) -> Result<(), Error> {
        let objects = self.read_record(app).await?.ok_or_else(|| {
            Error::from(ApplyError::new(app, ApplyCause::NotFound, "no app record"))
        })?;

        // reverse order: workloads go before the objects they reference
        let mut terminating = Vec::new();
        for object in objects.iter().rev() {
            match object
                .api(&self.client)
                .delete(&object.name, &DeleteParams::background())
                .await
            {
                Ok(response) => {
                    debug!(app, object = %object.describe(), "Deleting object");
                    if let Some(pending) = response.left() {
                        terminating.push((object, pending.metadata.uid));
                    }
                }
                Err(e) if is_not_found(&e) => {
                    warn!(app, object = %object.describe(), "Object already gone")
                }
                Err(e) => {
                    return Err(apply_error(app, &format!("failed to delete {}", object.describe()), e))
                }
            }
        }

        for (object, uid) in terminating {
            self.wait_until_gone(app, object, uid.as_deref()).await?;
        }

        match self
            .records()
            .delete(&Self::record_name(app), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(apply_error(app, "failed to delete app record", e)),
        }

        info!(app, objects = objects.len(), "Deleted app");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeployedApp>, Error> {
        let records = self
            .records()
            .list(&ListParams::default().labels(&format!("{APP_RECORD_LABEL}=true")))
            .await
            .map_err(|e| apply_error("*", "failed to list app records", e))?;

        let mut apps: Vec<DeployedApp> = records
            .items
            .into_iter()
            .filter_map(|record| {
                let data: BTreeMap<String, String> = record.data.unwrap_or_default();
                let name = data.get("app")?.clone();
                let kind = data.get("kind").cloned().unwrap_or_default();
                Some(DeployedApp { name, kind })
            })
            .collect();
        apps.sort();
        Ok(apps)
    }
}

/// SchemaProbe checking CRD presence over kube-rs
pub struct KubeSchemaProbe {
    client: Client,
}

impl KubeSchemaProbe {
    /// Create a probe using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemaProbe for KubeSchemaProbe {
    async fn schema_present(&self, crd: &str) -> Result<bool, Error> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        match crds.get(crd).await {
            Ok(found) => Ok(is_established(&found)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(apply_error(crd, "failed to check CRD", e)),
        }
    }
}

fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}
