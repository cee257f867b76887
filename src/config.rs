//! Runtime settings shared by the compiler, bootstrapper and reconciler
//!
//! Everything that used to be a process-wide toggle lives here and is passed
//! in at construction. The binary fills it from CLI flags and `RUNNERSET_*`
//! environment variables; library users start from [`Settings::default`].

use std::time::Duration;

/// Default namespace the runner scale sets are installed into
pub const DEFAULT_RUNNER_NAMESPACE: &str = "arc-runners";

/// Default namespace of the runner controller
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "arc-systems";

/// App name the controller manifest is applied under
pub const DEFAULT_CONTROLLER_APP: &str = "runner-controller";

/// Settings for compiling and converging runner installations
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Namespace for runner scale sets
    pub runner_namespace: String,
    /// Namespace for the runner controller
    pub controller_namespace: String,
    /// App name the controller manifest is applied under
    pub controller_app: String,
    /// Runner controller image
    pub controller_image: String,
    /// Runner image used by every scale set
    pub runner_image: String,
    /// Docker engine image for the dind sidecar
    pub dind_image: String,
    /// Storage class for the ephemeral work volume (None = cluster default)
    pub work_storage_class: Option<String>,
    /// Size requested for the ephemeral work volume
    pub work_volume_size: String,
    /// Host directory under which `auto` cache sources are generated
    pub cache_host_root: String,
    /// Interval between controller readiness polls
    pub poll_interval: Duration,
    /// Overall budget for controller readiness
    pub bootstrap_timeout: Duration,
    /// Number of instances converged concurrently (1 = sequential)
    pub concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runner_namespace: DEFAULT_RUNNER_NAMESPACE.to_string(),
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            controller_app: DEFAULT_CONTROLLER_APP.to_string(),
            controller_image: "ghcr.io/actions/gha-runner-scale-set-controller:0.10.1".to_string(),
            runner_image: "ghcr.io/actions/actions-runner:latest".to_string(),
            dind_image: "docker:dind".to_string(),
            work_storage_class: None,
            work_volume_size: "1Gi".to_string(),
            cache_host_root: "/var/lib/runnerset/cache".to_string(),
            poll_interval: Duration::from_secs(1),
            bootstrap_timeout: Duration::from_secs(120),
            concurrency: 1,
        }
    }
}

impl Settings {
    /// Override the readiness poll interval and timeout
    pub fn with_bootstrap_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.bootstrap_timeout = timeout;
        self
    }

    /// Override the convergence concurrency (clamped to at least 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Override the host directory for generated cache sources
    pub fn with_cache_host_root(mut self, root: impl Into<String>) -> Self {
        self.cache_host_root = root.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_poll_every_second() {
        let settings = Settings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.controller_app, DEFAULT_CONTROLLER_APP);
    }

    #[test]
    fn concurrency_never_drops_to_zero() {
        let settings = Settings::default().with_concurrency(0);
        assert_eq!(settings.concurrency, 1);
    }
}
