//! Fan-out of installations into concrete instances

use std::collections::BTreeMap;

use tracing::warn;

use super::types::{AuthSpec, CacheSource, ContainerMode, InstallationSpec};

/// A cache mount with its host source resolved for one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceCacheMount {
    /// Absolute container path
    pub target: String,
    /// Host path, or None for an ephemeral volume
    pub host_path: Option<String>,
}

/// One concrete, independently scaled unit derived from an installation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Instance name (also the app name it is deployed under)
    pub name: String,
    /// Name of the installation this instance came from
    pub installation: String,
    /// 0 for a single instance, 1..=K when fanned out
    pub ordinal: u32,
    /// Repository URL
    pub repository: String,
    /// Execution strategy
    pub container_mode: ContainerMode,
    /// Minimum idle runners
    pub min_replicas: u32,
    /// Maximum runners
    pub max_replicas: u32,
    /// Credentials
    pub auth: AuthSpec,
    /// Runner group
    pub runner_group: Option<String>,
    /// Cache mounts in declaration order
    pub cache_mounts: Vec<InstanceCacheMount>,
    /// Extra labels from the installation
    pub labels: BTreeMap<String, String>,
}

/// Expand an installation into its instances
///
/// An instance count of 0 or 1 yields a single instance named exactly after
/// the installation. A count of K > 1 yields `{name}-1` through `{name}-K`,
/// each pinned to one runner, since fan-out and replica scaling are mutually
/// exclusive. `auto` cache sources become `{cache_root}/{installation}/{slug}`
/// with an `-{ordinal}` suffix on fanned-out instances.
pub fn expand(spec: &InstallationSpec, cache_root: &str) -> Vec<InstanceSpec> {
    if !spec.is_fanned_out() {
        return vec![instance(spec, spec.name.clone(), 0, cache_root)];
    }

    if spec.min_replicas > 1 || spec.max_replicas > 1 {
        warn!(
            installation = %spec.name,
            instances = spec.instance_count,
            min_replicas = spec.min_replicas,
            max_replicas = spec.max_replicas,
            "Fanned-out installation pins each instance to 1 runner; replica bounds ignored"
        );
    }

    (1..=spec.instance_count)
        .map(|ordinal| {
            let mut inst = instance(spec, format!("{}-{}", spec.name, ordinal), ordinal, cache_root);
            inst.min_replicas = 1;
            inst.max_replicas = 1;
            inst
        })
        .collect()
}

fn instance(spec: &InstallationSpec, name: String, ordinal: u32, cache_root: &str) -> InstanceSpec {
    let cache_mounts = spec
        .cache_mounts
        .iter()
        .map(|mount| InstanceCacheMount {
            target: mount.target.clone(),
            host_path: match &mount.source {
                CacheSource::Ephemeral => None,
                CacheSource::Host(path) => Some(path.clone()),
                CacheSource::Auto => Some(auto_source(cache_root, &spec.name, &mount.target, ordinal)),
            },
        })
        .collect();

    InstanceSpec {
        name,
        installation: spec.name.clone(),
        ordinal,
        repository: spec.repository.clone(),
        container_mode: spec.container_mode,
        min_replicas: spec.min_replicas,
        max_replicas: spec.max_replicas,
        auth: spec.auth.clone(),
        runner_group: spec.runner_group.clone(),
        cache_mounts,
        labels: spec.labels.clone(),
    }
}

fn auto_source(cache_root: &str, installation: &str, target: &str, ordinal: u32) -> String {
    let slug = target
        .trim_matches('/')
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let root = cache_root.trim_end_matches('/');
    if ordinal == 0 {
        format!("{root}/{installation}/{slug}")
    } else {
        format!("{root}/{installation}/{slug}-{ordinal}")
    }
}
