//! Data values bound into base template slots

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::config::Settings;
use crate::installation::{check_cache_target, AuthMethod, InstanceSpec};

use super::error::CompileError;

/// Label carrying the instance name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Label carrying the installation name
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Label marking objects managed by runnerset
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY: &str = "runnerset";
/// Label carrying the instance ordinal
pub const LABEL_ORDINAL: &str = "runnerset.dev/ordinal";
/// Annotation carrying the container mode tag
pub const ANNOTATION_CONTAINER_MODE: &str = "runnerset.dev/container-mode";

/// Credentials secret as bound into the base
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AuthValues {
    /// Secret object name
    pub secret_name: String,
    /// Secret keys in the layout the runner controller expects
    pub data: BTreeMap<String, String>,
}

/// One cache mount with its deterministic volume name
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CacheMountValues {
    /// `cache-{index}`
    pub name: String,
    /// Absolute container path
    pub target: String,
    /// Host path, or None for an ephemeral volume
    pub host_path: Option<String>,
}

/// The value tree every slot of a runner base is bound from
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DataValues {
    /// Instance name
    pub name: String,
    /// Installation the instance belongs to
    pub installation: String,
    /// Target namespace
    pub namespace: String,
    /// Repository URL
    pub repository: String,
    /// Container mode tag
    pub container_mode: String,
    /// Instance ordinal (0 when not fanned out)
    pub ordinal: u32,
    /// Minimum idle runners
    pub min_runners: u32,
    /// Maximum runners
    pub max_runners: u32,
    /// Runner group, if any
    pub runner_group: Option<String>,
    /// Runner image
    pub runner_image: String,
    /// Docker engine image for the dind sidecar
    pub dind_image: String,
    /// Service account the runner pods run as
    pub service_account: String,
    /// Labels stamped on every object
    pub labels: BTreeMap<String, String>,
    /// Annotations on the scale set
    pub annotations: BTreeMap<String, String>,
    /// Credentials
    pub auth: AuthValues,
    /// Ephemeral volume source for the runner work directory
    pub work_volume: serde_json::Value,
    /// Cache mounts in declaration order; always present, possibly empty
    pub cache_mounts: Vec<CacheMountValues>,
}

/// Build the data values for one instance
pub fn build_data_values(
    instance: &InstanceSpec,
    settings: &Settings,
) -> Result<DataValues, CompileError> {
    if instance.name.trim().is_empty() {
        return Err(CompileError::validation("instance name must not be empty"));
    }
    if instance.repository.trim().is_empty() {
        return Err(CompileError::validation(format!(
            "instance '{}': repository must not be empty",
            instance.name
        )));
    }
    if !instance.repository.starts_with("https://") && !instance.repository.starts_with("http://") {
        return Err(CompileError::validation(format!(
            "instance '{}': repository '{}' must be an http(s) URL",
            instance.name, instance.repository
        )));
    }
    if instance.auth.secret.is_empty() {
        return Err(CompileError::validation(format!(
            "instance '{}': auth secret must not be empty",
            instance.name
        )));
    }

    let cache_mounts = instance
        .cache_mounts
        .iter()
        .enumerate()
        .map(|(index, mount)| {
            check_cache_target(&mount.target).map_err(|reason| {
                CompileError::validation(format!("instance '{}': {reason}", instance.name))
            })?;
            Ok(CacheMountValues {
                name: format!("cache-{index}"),
                target: mount.target.clone(),
                host_path: mount.host_path.clone(),
            })
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    // user labels never override the ones convergence relies on
    let mut labels = instance.labels.clone();
    labels.insert(LABEL_NAME.to_string(), instance.name.clone());
    labels.insert(LABEL_INSTANCE.to_string(), instance.installation.clone());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_ORDINAL.to_string(), instance.ordinal.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_CONTAINER_MODE.to_string(),
        instance.container_mode.as_str().to_string(),
    );

    Ok(DataValues {
        name: instance.name.clone(),
        installation: instance.installation.clone(),
        namespace: settings.runner_namespace.clone(),
        repository: instance.repository.clone(),
        container_mode: instance.container_mode.as_str().to_string(),
        ordinal: instance.ordinal,
        min_runners: instance.min_replicas,
        max_runners: instance.max_replicas,
        runner_group: instance.runner_group.clone(),
        runner_image: settings.runner_image.clone(),
        dind_image: settings.dind_image.clone(),
        service_account: format!("{}-runner", instance.name),
        labels,
        annotations,
        auth: auth_values(instance),
        work_volume: work_volume(settings),
        cache_mounts,
    })
}

fn auth_values(instance: &InstanceSpec) -> AuthValues {
    let mut data = BTreeMap::new();
    match instance.auth.method {
        AuthMethod::Token => {
            data.insert("github_token".to_string(), instance.auth.secret.clone());
        }
        AuthMethod::AppKey => {
            data.insert("github_app_private_key".to_string(), instance.auth.secret.clone());
            if let Some(app_id) = &instance.auth.app_id {
                data.insert("github_app_id".to_string(), app_id.clone());
            }
            if let Some(installation_id) = &instance.auth.installation_id {
                data.insert("github_app_installation_id".to_string(), installation_id.clone());
            }
        }
    }
    AuthValues {
        secret_name: format!("{}-auth", instance.name),
        data,
    }
}

fn work_volume(settings: &Settings) -> serde_json::Value {
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": settings.work_volume_size } },
    });
    if let Some(class) = &settings.work_storage_class {
        spec["storageClassName"] = json!(class);
    }
    json!({ "volumeClaimTemplate": { "spec": spec } })
}

/// Data values for the runner controller template
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ControllerValues {
    /// Controller namespace
    pub controller_namespace: String,
    /// Runner namespace created alongside the controller
    pub runner_namespace: String,
    /// Controller image
    pub image: String,
    /// Service account, cluster role and deployment name
    pub service_account: String,
    /// Labels stamped on every object
    pub labels: BTreeMap<String, String>,
    /// Deployment selector
    pub selector: BTreeMap<String, String>,
}

/// Build the data values for the controller template
pub fn build_controller_values(settings: &Settings) -> ControllerValues {
    let mut selector = BTreeMap::new();
    selector.insert(LABEL_NAME.to_string(), settings.controller_app.clone());

    let mut labels = selector.clone();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());

    ControllerValues {
        controller_namespace: settings.controller_namespace.clone(),
        runner_namespace: settings.runner_namespace.clone(),
        image: settings.controller_image.clone(),
        service_account: settings.controller_app.clone(),
        labels,
        selector,
    }
}
