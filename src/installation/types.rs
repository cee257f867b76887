//! Installation types as declared by the user and held in the config store

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Container targets that may never be used for a cache mount
///
/// `/nix` is the runner image's own package-store root; mounting over it
/// hides the tools the runner itself executes.
pub const RESERVED_CACHE_TARGETS: &[&str] = &["/", "/nix", "/home/runner"];

/// Source value that asks for a generated host path
pub const AUTO_CACHE_SOURCE: &str = "auto";

/// Most instances one installation may fan out into
pub const MAX_INSTANCES: u32 = 64;

/// Longest installation name accepted, leaving room for ordinal and resource suffixes
pub const MAX_NAME_LEN: usize = 40;

/// Execution strategy for runner workloads
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum ContainerMode {
    /// Jobs run in separate job containers via the kubernetes container hooks
    #[default]
    Standard,
    /// Runner gets a docker-in-docker sidecar
    Dind,
    /// Privileged runner with host namespaces exposed to job containers and
    /// build caches mounted into the runner pod
    PrivilegedCached,
}

impl ContainerMode {
    /// Tag used in data values and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Dind => "dind",
            Self::PrivilegedCached => "privileged-cached",
        }
    }
}

impl std::str::FromStr for ContainerMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "kubernetes" => Ok(Self::Standard),
            "dind" => Ok(Self::Dind),
            "privileged-cached" | "privileged" => Ok(Self::PrivilegedCached),
            _ => Err(crate::Error::validation(format!(
                "unknown container mode: {s}, expected one of: standard, dind, privileged-cached"
            ))),
        }
    }
}

impl TryFrom<String> for ContainerMode {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContainerMode> for String {
    fn from(mode: ContainerMode) -> Self {
        mode.as_str().to_string()
    }
}

impl std::fmt::Display for ContainerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the runner authenticates against the repository host
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// Personal access token
    #[default]
    Token,
    /// App private key
    AppKey,
}

/// Credentials stored into the per-instance secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// Authentication method
    #[serde(default)]
    pub method: AuthMethod,
    /// Token or PEM private key, depending on `method`
    pub secret: String,
    /// App id (app-key auth only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// App installation id (app-key auth only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
}

/// Where a cache mount's data lives
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum CacheSource {
    /// Non-persistent volume that lives as long as the pod
    #[default]
    Ephemeral,
    /// Host path generated per instance under the cache host root
    Auto,
    /// Host path given verbatim
    Host(String),
}

impl From<Option<String>> for CacheSource {
    fn from(value: Option<String>) -> Self {
        match value.as_deref().map(str::trim) {
            None | Some("") => Self::Ephemeral,
            Some(AUTO_CACHE_SOURCE) => Self::Auto,
            Some(path) => Self::Host(path.to_string()),
        }
    }
}

impl From<CacheSource> for Option<String> {
    fn from(source: CacheSource) -> Self {
        match source {
            CacheSource::Ephemeral => None,
            CacheSource::Auto => Some(AUTO_CACHE_SOURCE.to_string()),
            CacheSource::Host(path) => Some(path),
        }
    }
}

/// A build cache mounted into the runner
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheMount {
    /// Absolute container path
    pub target: String,
    /// Backing storage
    #[serde(default)]
    pub source: CacheSource,
}

impl CacheMount {
    /// Ephemeral cache at `target`
    pub fn ephemeral(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: CacheSource::Ephemeral,
        }
    }

    /// Host-backed cache at `target`, sourced from `path`
    pub fn host(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: CacheSource::Host(path.into()),
        }
    }
}

/// Check a cache target path, returning a human-readable reason on failure
pub(crate) fn check_cache_target(target: &str) -> Result<(), String> {
    if target.is_empty() {
        return Err("cache mount target must not be empty".to_string());
    }
    if !target.starts_with('/') {
        return Err(format!("cache mount target '{target}' must be an absolute path"));
    }
    let normalized = match target.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    if RESERVED_CACHE_TARGETS.contains(&normalized) {
        return Err(format!("cache mount target '{target}' is reserved"));
    }
    Ok(())
}

/// A user-declared runner deployment
///
/// An unknown `containerMode` tag does not fail deserialization. The tag is
/// kept as written and [`InstallationSpec::validate`] rejects the
/// installation, so one bad entry never hides the rest of a store.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "InstallationDocument", into = "InstallationDocument")]
pub struct InstallationSpec {
    /// Unique installation name
    pub name: String,
    /// Repository (or organization) URL runners register against
    pub repository: String,
    /// Execution strategy
    pub container_mode: ContainerMode,
    /// Minimum idle runners
    pub min_replicas: u32,
    /// Maximum runners
    pub max_replicas: u32,
    /// Number of independently scaled instances (0 is treated as 1)
    pub instance_count: u32,
    /// Build caches, in mount order
    pub cache_mounts: Vec<CacheMount>,
    /// Credentials
    pub auth: AuthSpec,
    /// Runner group the scale set registers into
    pub runner_group: Option<String>,
    /// Extra labels stamped on every object of the installation
    pub labels: BTreeMap<String, String>,
    unknown_mode: Option<String>,
}

/// Wire shape of an installation, with the mode tag as written
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstallationDocument {
    name: String,
    repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container_mode: Option<String>,
    #[serde(default)]
    min_replicas: u32,
    #[serde(default = "default_max_replicas")]
    max_replicas: u32,
    #[serde(default = "default_instance_count")]
    instance_count: u32,
    #[serde(default)]
    cache_mounts: Vec<CacheMount>,
    auth: AuthSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runner_group: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

impl From<InstallationDocument> for InstallationSpec {
    fn from(doc: InstallationDocument) -> Self {
        let (container_mode, unknown_mode) = match doc.container_mode {
            None => (ContainerMode::default(), None),
            Some(tag) => match tag.parse() {
                Ok(mode) => (mode, None),
                Err(_) => (ContainerMode::default(), Some(tag)),
            },
        };
        Self {
            name: doc.name,
            repository: doc.repository,
            container_mode,
            min_replicas: doc.min_replicas,
            max_replicas: doc.max_replicas,
            instance_count: doc.instance_count,
            cache_mounts: doc.cache_mounts,
            auth: doc.auth,
            runner_group: doc.runner_group,
            labels: doc.labels,
            unknown_mode,
        }
    }
}

impl From<InstallationSpec> for InstallationDocument {
    fn from(spec: InstallationSpec) -> Self {
        let container_mode = spec
            .unknown_mode
            .unwrap_or_else(|| spec.container_mode.as_str().to_string());
        Self {
            name: spec.name,
            repository: spec.repository,
            container_mode: Some(container_mode),
            min_replicas: spec.min_replicas,
            max_replicas: spec.max_replicas,
            instance_count: spec.instance_count,
            cache_mounts: spec.cache_mounts,
            auth: spec.auth,
            runner_group: spec.runner_group,
            labels: spec.labels,
        }
    }
}

fn default_max_replicas() -> u32 {
    1
}

fn default_instance_count() -> u32 {
    1
}

impl InstallationSpec {
    /// Start an installation with defaults for everything but the identity
    pub fn new(name: impl Into<String>, repository: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            container_mode: ContainerMode::default(),
            min_replicas: 0,
            max_replicas: default_max_replicas(),
            instance_count: default_instance_count(),
            cache_mounts: Vec::new(),
            auth: AuthSpec {
                method: AuthMethod::Token,
                secret: secret.into(),
                app_id: None,
                installation_id: None,
            },
            runner_group: None,
            labels: BTreeMap::new(),
            unknown_mode: None,
        }
    }

    /// Mode tag as written when it names no known container mode
    pub fn unknown_mode(&self) -> Option<&str> {
        self.unknown_mode.as_deref()
    }

    /// Switch to a known container mode, dropping any unknown tag
    pub fn set_container_mode(&mut self, mode: ContainerMode) {
        self.container_mode = mode;
        self.unknown_mode = None;
    }

    /// True when this installation fans out into several instances
    pub fn is_fanned_out(&self) -> bool {
        self.instance_count > 1
    }

    /// Validate the installation
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(tag) = &self.unknown_mode {
            return Err(crate::Error::validation(format!(
                "installation '{}': unknown container mode: {tag}, \
                 expected one of: standard, dind, privileged-cached",
                self.name
            )));
        }

        validate_name(&self.name)?;

        if self.repository.trim().is_empty() {
            return Err(crate::Error::validation(format!(
                "installation '{}': repository must not be empty",
                self.name
            )));
        }

        if self.min_replicas > self.max_replicas {
            return Err(crate::Error::validation(format!(
                "installation '{}': minReplicas ({}) exceeds maxReplicas ({})",
                self.name, self.min_replicas, self.max_replicas
            )));
        }

        if self.instance_count > MAX_INSTANCES {
            return Err(crate::Error::validation(format!(
                "installation '{}': instanceCount ({}) exceeds the limit of {MAX_INSTANCES}",
                self.name, self.instance_count
            )));
        }

        if self.auth.secret.is_empty() {
            return Err(crate::Error::validation(format!(
                "installation '{}': auth secret must not be empty",
                self.name
            )));
        }

        let mut seen = std::collections::BTreeSet::new();
        for mount in &self.cache_mounts {
            check_cache_target(&mount.target).map_err(|reason| {
                crate::Error::validation(format!("installation '{}': {reason}", self.name))
            })?;
            if !seen.insert(mount.target.trim_end_matches('/')) {
                return Err(crate::Error::validation(format!(
                    "installation '{}': cache mount target '{}' is declared twice",
                    self.name, mount.target
                )));
            }
        }

        Ok(())
    }
}

/// Validate an installation name: a DNS-1123 label short enough for suffixes
pub fn validate_name(name: &str) -> Result<(), crate::Error> {
    if name.is_empty() {
        return Err(crate::Error::validation("installation name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(crate::Error::validation(format!(
            "installation name '{name}' is longer than {MAX_NAME_LEN} characters"
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(crate::Error::validation(format!(
            "installation name '{name}' must consist of lowercase alphanumerics and '-', \
             and start and end with an alphanumeric"
        )));
    }
    Ok(())
}
