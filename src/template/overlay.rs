//! Container-mode overlays
//!
//! Exactly one [`ModeOverlay`] variant is applied to the rendered base, as a
//! single transform of the runner pod template. Each variant carries
//! everything it needs, so no variant depends on another having run first.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, PodSecurityContext, PodSpec,
    SecurityContext, Volume, VolumeMount,
};
use serde_json::json;

use crate::installation::ContainerMode;

use super::error::CompileError;
use super::values::{CacheMountValues, DataValues};

/// Kind of the document holding the runner pod template
pub const RUNNER_SET_KIND: &str = "AutoscalingRunnerSet";
/// Name of the runner container in every base
pub const RUNNER_CONTAINER: &str = "runner";
/// Name of the docker-in-docker sidecar
pub const DIND_CONTAINER: &str = "dind";
/// Shared docker socket volume
pub const DIND_SOCKET_VOLUME: &str = "dind-sock";
/// Hook extension volume name
pub const HOOK_EXTENSION_VOLUME: &str = "hook-extension";

const ENV_CONTAINER_HOOKS: &str = "ACTIONS_RUNNER_CONTAINER_HOOKS";
const ENV_REQUIRE_JOB_CONTAINER: &str = "ACTIONS_RUNNER_REQUIRE_JOB_CONTAINER";
const ENV_HOOK_TEMPLATE: &str = "ACTIONS_RUNNER_CONTAINER_HOOK_TEMPLATE";
const ENV_DOCKER_HOST: &str = "DOCKER_HOST";

const HOOK_ENTRYPOINT: &str = "/home/runner/k8s/index.js";
const HOOK_ENTRYPOINT_CACHED: &str = "/home/runner/k8s-novolume/index.js";
const HOOK_EXTENSION_DIR: &str = "/home/runner/hook-extension";
const HOOK_EXTENSION_KEY: &str = "content";
const DOCKER_SOCKET_DIR: &str = "/var/run";
const DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const WORK_VOLUME: &str = "work";
const WORK_DIR: &str = "/home/runner/_work";

/// Group owning the work directory and caches in privileged pods
pub const RUNNER_FS_GROUP: i64 = 123;

/// Host paths exposed to job containers of privileged-cached runners,
/// as `(volume name, host path, mount path)`
const HOST_NAMESPACE_PATHS: &[(&str, &str, &str)] = &[
    ("host-proc", "/proc", "/host/proc"),
    ("host-cgroup", "/sys/fs/cgroup", "/sys/fs/cgroup"),
    ("host-dev", "/dev", "/dev"),
];

/// The one patch applied on top of a base, by container mode
#[derive(Clone, Debug, PartialEq)]
pub enum ModeOverlay {
    /// Job containers via kubernetes hooks, work volume only
    Standard,
    /// Privileged runner, hook extension and build caches
    PrivilegedCached {
        /// Name of the hook-extension ConfigMap
        hook_extension: String,
        /// Namespace the ConfigMap lives in
        namespace: String,
        /// Labels for the ConfigMap
        labels: BTreeMap<String, String>,
        /// Caches mounted into the runner
        caches: Vec<CacheMountValues>,
    },
    /// Nested docker engine sidecar
    Dind {
        /// Docker engine image
        image: String,
    },
}

impl ModeOverlay {
    /// Build the overlay for the given data values
    pub fn for_values(mode: ContainerMode, values: &DataValues) -> Self {
        match mode {
            ContainerMode::Standard => Self::Standard,
            ContainerMode::PrivilegedCached => Self::PrivilegedCached {
                hook_extension: format!("{}-{}", values.name, HOOK_EXTENSION_VOLUME),
                namespace: values.namespace.clone(),
                labels: values.labels.clone(),
                caches: values.cache_mounts.clone(),
            },
            ContainerMode::Dind => Self::Dind {
                image: values.dind_image.clone(),
            },
        }
    }

    /// Apply the overlay to rendered base documents
    pub fn apply(&self, documents: &mut Vec<serde_json::Value>) -> Result<(), CompileError> {
        let index = documents
            .iter()
            .position(|doc| doc["kind"] == RUNNER_SET_KIND)
            .ok_or_else(|| {
                CompileError::overlay(format!("base has no {RUNNER_SET_KIND} document"))
            })?;

        let slot = documents[index]
            .pointer_mut("/spec/template/spec")
            .ok_or_else(|| CompileError::overlay("runner set has no spec.template.spec"))?;
        let mut pod: PodSpec = serde_json::from_value(slot.take())
            .map_err(|e| CompileError::overlay(format!("runner pod template is invalid: {e}")))?;

        self.patch_pod(&mut pod)?;

        *slot = serde_json::to_value(&pod)
            .map_err(|e| CompileError::overlay(format!("failed to serialize runner pod: {e}")))?;

        if let Self::PrivilegedCached {
            hook_extension,
            namespace,
            labels,
            ..
        } = self
        {
            let config_map = hook_extension_config_map(hook_extension, namespace, labels)?;
            documents.insert(index, config_map);
        }

        Ok(())
    }

    fn patch_pod(&self, pod: &mut PodSpec) -> Result<(), CompileError> {
        match self {
            Self::Standard => {
                let runner = runner_container(pod)?;
                set_env(runner, ENV_CONTAINER_HOOKS, HOOK_ENTRYPOINT);
                set_env(runner, ENV_REQUIRE_JOB_CONTAINER, "true");
            }
            Self::PrivilegedCached {
                hook_extension,
                caches,
                ..
            } => {
                pod.security_context = Some(PodSecurityContext {
                    fs_group: Some(RUNNER_FS_GROUP),
                    ..Default::default()
                });

                let volumes = pod.volumes.get_or_insert_with(Vec::new);
                volumes.push(config_map_volume(HOOK_EXTENSION_VOLUME, hook_extension)?);
                for cache in caches {
                    volumes.push(cache_volume(cache));
                }

                let runner = runner_container(pod)?;
                runner.security_context = Some(privileged());
                set_env(runner, ENV_CONTAINER_HOOKS, HOOK_ENTRYPOINT_CACHED);
                set_env(
                    runner,
                    ENV_HOOK_TEMPLATE,
                    &format!("{HOOK_EXTENSION_DIR}/{HOOK_EXTENSION_KEY}"),
                );

                let mounts = runner.volume_mounts.get_or_insert_with(Vec::new);
                mounts.push(VolumeMount {
                    name: HOOK_EXTENSION_VOLUME.to_string(),
                    mount_path: HOOK_EXTENSION_DIR.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
                for cache in caches {
                    mounts.push(VolumeMount {
                        name: cache.name.clone(),
                        mount_path: cache.target.clone(),
                        ..Default::default()
                    });
                }
            }
            Self::Dind { image } => {
                pod.volumes.get_or_insert_with(Vec::new).push(Volume {
                    name: DIND_SOCKET_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                });

                let runner = runner_container(pod)?;
                set_env(runner, ENV_DOCKER_HOST, DOCKER_HOST);
                runner
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(socket_mount());

                pod.containers.push(Container {
                    name: DIND_CONTAINER.to_string(),
                    image: Some(image.clone()),
                    args: Some(vec![
                        "dockerd".to_string(),
                        format!("--host={DOCKER_HOST}"),
                        format!("--group={RUNNER_FS_GROUP}"),
                    ]),
                    security_context: Some(privileged()),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: WORK_VOLUME.to_string(),
                            mount_path: WORK_DIR.to_string(),
                            ..Default::default()
                        },
                        socket_mount(),
                    ]),
                    ..Default::default()
                });
            }
        }
        Ok(())
    }
}

fn runner_container(pod: &mut PodSpec) -> Result<&mut Container, CompileError> {
    pod.containers
        .iter_mut()
        .find(|c| c.name == RUNNER_CONTAINER)
        .ok_or_else(|| CompileError::overlay("runner pod template has no runner container"))
}

/// Set an env var, replacing an existing entry of the same name in place
fn set_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    let var = EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

fn socket_mount() -> VolumeMount {
    VolumeMount {
        name: DIND_SOCKET_VOLUME.to_string(),
        mount_path: DOCKER_SOCKET_DIR.to_string(),
        ..Default::default()
    }
}

fn cache_volume(cache: &CacheMountValues) -> Volume {
    match &cache.host_path {
        Some(path) => Volume {
            name: cache.name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: path.clone(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        },
        None => Volume {
            name: cache.name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    }
}

fn config_map_volume(name: &str, config_map: &str) -> Result<Volume, CompileError> {
    serde_json::from_value(json!({
        "name": name,
        "configMap": { "name": config_map },
    }))
    .map_err(|e| CompileError::overlay(format!("invalid configMap volume: {e}")))
}

/// The pod-template patch the container hooks merge into every job pod
fn hook_extension_content() -> serde_json::Value {
    let mounts: Vec<_> = HOST_NAMESPACE_PATHS
        .iter()
        .map(|(name, _, mount_path)| json!({ "name": name, "mountPath": mount_path }))
        .collect();
    let volumes: Vec<_> = HOST_NAMESPACE_PATHS
        .iter()
        .map(|(name, host_path, _)| json!({ "name": name, "hostPath": { "path": host_path } }))
        .collect();

    json!({
        "spec": {
            "containers": [{
                "name": "$job",
                "securityContext": { "privileged": true },
                "volumeMounts": mounts,
            }],
            "volumes": volumes,
        }
    })
}

fn hook_extension_config_map(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<serde_json::Value, CompileError> {
    let content = serde_yaml::to_string(&hook_extension_content())
        .map_err(|e| CompileError::overlay(format!("failed to serialize hook extension: {e}")))?;

    Ok(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
        },
        "data": { HOOK_EXTENSION_KEY: content },
    }))
}
