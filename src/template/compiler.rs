//! Instance compiler
//!
//! Compiles one [`InstanceSpec`] into a [`Manifest`]: select the base for the
//! container mode, build the data values, render the base, apply the mode
//! overlay, serialize. Every stage is pure, so a compiler can be shared
//! across threads and called concurrently for distinct instances.

use tracing::{debug, warn};

use crate::config::Settings;
use crate::installation::{ContainerMode, InstanceSpec};

use super::base::{select_base, BaseTemplate, CONTROLLER_TEMPLATE};
use super::engine::TemplateEngine;
use super::error::CompileError;
use super::manifest::Manifest;
use super::overlay::ModeOverlay;
use super::values::{build_controller_values, build_data_values, DataValues};

/// Compiles instances and the controller manifest
pub struct TemplateCompiler {
    engine: TemplateEngine,
    settings: Settings,
}

impl TemplateCompiler {
    /// Create a compiler with the given settings
    pub fn new(settings: Settings) -> Self {
        Self {
            engine: TemplateEngine::new(),
            settings,
        }
    }

    /// Settings the compiler was built with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Base template for a container mode
    pub fn select_base(&self, mode: ContainerMode) -> &'static BaseTemplate {
        select_base(mode)
    }

    /// Data values for an instance
    ///
    /// Cache mounts only take effect in privileged-cached mode; other modes
    /// drop them with a warning.
    pub fn build_data_values(&self, instance: &InstanceSpec) -> Result<DataValues, CompileError> {
        let mut values = build_data_values(instance, &self.settings)?;
        if instance.container_mode != ContainerMode::PrivilegedCached
            && !values.cache_mounts.is_empty()
        {
            warn!(
                instance = %instance.name,
                mode = %instance.container_mode,
                mounts = values.cache_mounts.len(),
                "Cache mounts are only honored in privileged-cached mode; ignoring"
            );
            values.cache_mounts.clear();
        }
        Ok(values)
    }

    /// Render `base` with `values` and apply the overlay for `mode`
    pub fn apply_overlay(
        &self,
        base: &BaseTemplate,
        mode: ContainerMode,
        values: &DataValues,
    ) -> Result<Manifest, CompileError> {
        let mut documents = self.engine.render_documents(base, values)?;
        ModeOverlay::for_values(mode, values)
            .apply(&mut documents)
            .map_err(|e| e.in_template(base.name))?;
        Manifest::from_documents(documents).map_err(|e| e.in_template(base.name))
    }

    /// Compile one instance into its manifest
    pub fn compile(&self, instance: &InstanceSpec) -> Result<Manifest, CompileError> {
        let base = self.select_base(instance.container_mode);
        let values = self.build_data_values(instance)?;
        let manifest = self.apply_overlay(base, instance.container_mode, &values)?;
        debug!(
            instance = %instance.name,
            mode = %instance.container_mode,
            base = base.name,
            documents = manifest.len(),
            "Compiled instance manifest"
        );
        Ok(manifest)
    }

    /// Compile the runner controller manifest (CRDs, RBAC, deployment)
    pub fn compile_controller(&self) -> Result<Manifest, CompileError> {
        let values = build_controller_values(&self.settings);
        let documents = self.engine.render_documents(&CONTROLLER_TEMPLATE, &values)?;
        Manifest::from_documents(documents).map_err(|e| e.in_template(CONTROLLER_TEMPLATE.name))
    }
}

impl Default for TemplateCompiler {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
