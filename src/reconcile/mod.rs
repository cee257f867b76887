//! Convergence of the cluster onto the stored installations
//!
//! One pass:
//!
//! 1. check the hosting cluster exists (fatal [`Error::ClusterMissing`])
//! 2. read installations from the [`ConfigStore`]
//! 3. make sure the runner controller is ready
//! 4. list deployed apps (never cached between passes)
//! 5. [`Reconciler::converge`]: replace or apply every desired instance,
//!    then delete deployed apps nobody wants any more
//!
//! Instances are independent. A failing instance is recorded in the
//! [`ConvergeReport`] and the pass moves on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::bootstrap::ControllerBootstrapper;
use crate::cluster::{ApplyCause, ClusterProvisioner, DeployedApp, ManifestApplier, SchemaProbe};
use crate::config::Settings;
use crate::installation::{expand, InstallationSpec, InstanceSpec};
use crate::store::ConfigStore;
use crate::template::TemplateCompiler;
use crate::Error;

/// What convergence did, or tried to do, for one app
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConvergeAction {
    /// First install of a desired instance
    Apply,
    /// Delete then re-apply of an already deployed instance
    Replace,
    /// Removal of an app no installation wants
    Delete,
    /// Left untouched because its installation is invalid
    Skip,
}

impl fmt::Display for ConvergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Apply => "apply",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// Result of converging one app
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceOutcome {
    /// App (instance or installation) name
    pub name: String,
    /// Action taken
    pub action: ConvergeAction,
    /// Failure message, None on success
    pub error: Option<String>,
}

impl InstanceOutcome {
    fn ok(name: impl Into<String>, action: ConvergeAction) -> Self {
        Self {
            name: name.into(),
            action,
            error: None,
        }
    }

    fn failed(name: impl Into<String>, action: ConvergeAction, error: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            action,
            error: Some(error.to_string()),
        }
    }

    /// True when the action succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-app outcomes of a convergence pass, in processing order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Outcomes: desired instances first, then deletions
    pub outcomes: Vec<InstanceOutcome>,
}

impl ConvergeReport {
    /// True when every app converged
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(InstanceOutcome::is_success)
    }

    /// Outcomes that failed
    pub fn failures(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Names that got the given action, successful or not
    pub fn names_with(&self, action: ConvergeAction) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.action == action)
            .map(|o| o.name.as_str())
            .collect()
    }

    /// Outcome for an app name
    pub fn outcome(&self, name: &str) -> Option<&InstanceOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

impl fmt::Display for ConvergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failures().count();
        write!(
            f,
            "{} apps converged, {} failed",
            self.outcomes.len() - failed,
            failed
        )
    }
}

/// Expands installations and converges the cluster onto them
pub struct Reconciler {
    compiler: Arc<TemplateCompiler>,
    applier: Arc<dyn ManifestApplier>,
    provisioner: Arc<dyn ClusterProvisioner>,
    bootstrapper: ControllerBootstrapper,
}

impl Reconciler {
    /// Create a reconciler over the given collaborators
    pub fn new(
        settings: Settings,
        applier: Arc<dyn ManifestApplier>,
        probe: Arc<dyn SchemaProbe>,
        provisioner: Arc<dyn ClusterProvisioner>,
    ) -> Self {
        let compiler = Arc::new(TemplateCompiler::new(settings));
        let bootstrapper = ControllerBootstrapper::new(applier.clone(), probe, compiler.clone());
        Self {
            compiler,
            applier,
            provisioner,
            bootstrapper,
        }
    }

    /// Compiler used for every instance
    pub fn compiler(&self) -> &TemplateCompiler {
        &self.compiler
    }

    fn settings(&self) -> &Settings {
        self.compiler.settings()
    }

    /// Expand one installation into its instances
    pub fn expand(&self, spec: &InstallationSpec) -> Vec<InstanceSpec> {
        expand(spec, &self.settings().cache_host_root)
    }

    /// Run one full convergence pass against the store
    ///
    /// Returns an error only for pass-level failures (missing cluster,
    /// store, bootstrap, listing, cancellation). Per-instance failures are in
    /// the report.
    #[instrument(skip_all)]
    pub async fn reconcile(
        &self,
        store: &dyn ConfigStore,
        cancel: &CancellationToken,
    ) -> Result<ConvergeReport, Error> {
        if !self.provisioner.exists().await? {
            return Err(Error::ClusterMissing(self.provisioner.name()));
        }

        let installations = store.list().await?;
        info!(installations = installations.len(), "Reconciling");

        self.bootstrapper.ensure_ready(cancel).await?;

        let deployed = self.applier.list().await.map_err(|e| match e {
            Error::Apply(ref cause) if cause.cause == ApplyCause::ClusterUnreachable => {
                error!(error = %e, "Hosting cluster stopped answering");
                Error::ClusterMissing(self.provisioner.name())
            }
            other => other,
        })?;

        let mut desired = Vec::new();
        let mut held = Vec::new();
        for spec in &installations {
            match spec.validate() {
                Ok(()) => desired.extend(self.expand(spec)),
                Err(e) => {
                    error!(installation = %spec.name, error = %e, "Invalid installation; leaving it untouched");
                    held.push((spec.name.clone(), e.to_string(), self.expand(spec)));
                }
            }
        }

        let protected: BTreeSet<String> = held
            .iter()
            .flat_map(|(_, _, instances)| instances.iter().map(|i| i.name.clone()))
            .collect();
        let mut report = self
            .converge_protected(&desired, &deployed, &protected, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(Error::cancelled("reconcile"));
        }
        report.outcomes.extend(
            held.into_iter()
                .map(|(name, e, _)| InstanceOutcome::failed(name, ConvergeAction::Skip, e)),
        );

        info!(%report, "Reconcile pass finished");
        Ok(report)
    }

    /// Converge the deployed apps onto the desired instances
    ///
    /// Desired instances that are deployed are deleted then re-applied,
    /// the others applied. Deployed apps not desired are deleted, except
    /// the runner controller.
    pub async fn converge(
        &self,
        desired: &[InstanceSpec],
        deployed: &[DeployedApp],
    ) -> ConvergeReport {
        self.converge_protected(desired, deployed, &BTreeSet::new(), &CancellationToken::new())
            .await
    }

    /// Converge, leaving `protected` names alone and stopping early once
    /// `cancel` fires
    async fn converge_protected(
        &self,
        desired: &[InstanceSpec],
        deployed: &[DeployedApp],
        protected: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> ConvergeReport {
        let controller_app = self.settings().controller_app.as_str();
        let deployed: BTreeSet<&str> = deployed
            .iter()
            .map(|app| app.name.as_str())
            .filter(|name| *name != controller_app)
            .collect();

        // the same name twice would race its own delete-then-apply
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        let mut unique = Vec::new();
        let mut outcomes = Vec::new();
        for instance in desired {
            if instance.name == controller_app {
                outcomes.push(InstanceOutcome::failed(
                    &instance.name,
                    ConvergeAction::Skip,
                    "name is reserved for the runner controller",
                ));
                continue;
            }
            match seen.insert(&instance.name, &instance.installation) {
                None => unique.push(instance),
                Some(other) => outcomes.push(InstanceOutcome::failed(
                    &instance.name,
                    ConvergeAction::Skip,
                    format!("name collides with an instance of installation '{other}'"),
                )),
            }
        }

        let concurrency = self.settings().concurrency.max(1);
        let deployed_names = &deployed;
        let converged: Vec<Option<InstanceOutcome>> = stream::iter(unique)
            .map(|instance| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let is_deployed = deployed_names.contains(instance.name.as_str());
                Some(self.converge_instance(instance, is_deployed).await)
            })
            .buffered(concurrency)
            .collect()
            .await;
        let mut report = ConvergeReport {
            outcomes: converged.into_iter().flatten().collect(),
        };
        report.outcomes.extend(outcomes);

        let wanted: BTreeSet<&str> = desired.iter().map(|i| i.name.as_str()).collect();
        for name in deployed {
            if wanted.contains(name) || protected.contains(name) {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }
            report.outcomes.push(self.delete_app(name).await);
        }

        report
    }

    async fn converge_instance(&self, instance: &InstanceSpec, is_deployed: bool) -> InstanceOutcome {
        let action = if is_deployed {
            ConvergeAction::Replace
        } else {
            ConvergeAction::Apply
        };

        // compile first so a bad instance never takes down the running one
        let manifest = match self.compiler.compile(instance) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(instance = %instance.name, error = %e, "Compile failed");
                return InstanceOutcome::failed(&instance.name, action, e);
            }
        };

        if is_deployed {
            match self.applier.delete(&instance.name).await {
                Ok(()) => {}
                Err(Error::Apply(e)) if e.cause == ApplyCause::NotFound => {
                    warn!(instance = %instance.name, "Instance vanished before replace");
                }
                Err(e) => {
                    error!(instance = %instance.name, error = %e, "Delete before replace failed");
                    return InstanceOutcome::failed(&instance.name, action, e);
                }
            }
        }

        match self.applier.apply(&instance.name, manifest.as_bytes()).await {
            Ok(()) => {
                info!(instance = %instance.name, %action, mode = %instance.container_mode, "Instance converged");
                InstanceOutcome::ok(&instance.name, action)
            }
            Err(e) => {
                error!(instance = %instance.name, %action, error = %e, "Apply failed");
                InstanceOutcome::failed(&instance.name, action, e)
            }
        }
    }

    async fn delete_app(&self, name: &str) -> InstanceOutcome {
        match self.applier.delete(name).await {
            Ok(()) => {
                info!(app = name, "Deleted app no longer desired");
                InstanceOutcome::ok(name, ConvergeAction::Delete)
            }
            Err(e) => {
                error!(app = name, error = %e, "Delete failed");
                InstanceOutcome::failed(name, ConvergeAction::Delete, e)
            }
        }
    }
}
