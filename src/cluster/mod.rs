//! Cluster-facing collaborators
//!
//! The reconciler and bootstrapper never talk to Kubernetes directly. They go
//! through three seams, each mockable in tests:
//!
//! - [`ManifestApplier`] applies, deletes and lists named apps
//! - [`SchemaProbe`] reports whether a CRD is served
//! - [`ClusterProvisioner`] creates and tears down the hosting cluster
//!
//! [`KubeApplier`] and [`KubeSchemaProbe`] implement the first two over
//! kube-rs; [`KindProvisioner`] implements the last by driving `kind`.

mod kind;
mod kube_client;

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::Error;

pub use self::kind::{KindProvisioner, DEFAULT_CLUSTER_NAME};
pub use self::kube_client::{
    client_from_kubeconfig, KubeApplier, KubeSchemaProbe, APP_RECORD_LABEL, DEFAULT_DELETION_TIMEOUT,
};

/// An app currently deployed on the cluster
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeployedApp {
    /// App name (an instance name, or the controller app)
    pub name: String,
    /// Kind of the app's workload object
    pub kind: String,
}

impl DeployedApp {
    /// Create a deployed app entry
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Why an apply, delete or list failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyCause {
    /// An object the apply creates is already there
    AlreadyExists,
    /// The API server could not be reached
    ClusterUnreachable,
    /// The app or one of its objects does not exist
    NotFound,
    /// Anything else (admission, schema, permissions)
    Other,
}

impl fmt::Display for ApplyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyExists => "already exists",
            Self::ClusterUnreachable => "cluster unreachable",
            Self::NotFound => "not found",
            Self::Other => "failed",
        };
        f.write_str(s)
    }
}

/// Failure of an external apply, delete or list
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("app '{app}': {cause}: {message}")]
pub struct ApplyError {
    /// App the operation targeted
    pub app: String,
    /// Classified cause
    pub cause: ApplyCause,
    /// Underlying message
    pub message: String,
}

impl ApplyError {
    /// Create an apply error
    pub fn new(app: impl Into<String>, cause: ApplyCause, message: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            cause,
            message: message.into(),
        }
    }

    /// True when the failure means the objects are already in place
    pub fn is_already_exists(&self) -> bool {
        self.cause == ApplyCause::AlreadyExists
    }
}

/// Applies compiled manifests to the cluster as named apps
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply a multi-document manifest under the given app name
    async fn apply(&self, app: &str, manifest: &[u8]) -> Result<(), Error>;

    /// Delete every object previously applied under the app name
    async fn delete(&self, app: &str) -> Result<(), Error>;

    /// List the apps currently deployed
    async fn list(&self) -> Result<Vec<DeployedApp>, Error>;
}

/// Reports whether a schema extension is served by the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaProbe: Send + Sync {
    /// True when the named CRD exists and is established
    async fn schema_present(&self, crd: &str) -> Result<bool, Error>;
}

/// Creates and deletes the hosting cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Name of the hosting cluster
    fn name(&self) -> String;

    /// True when the hosting cluster exists
    async fn exists(&self) -> Result<bool, Error>;

    /// Create the hosting cluster
    async fn create(&self) -> Result<(), Error>;

    /// Delete the hosting cluster
    async fn delete(&self) -> Result<(), Error>;

    /// Kubeconfig for connecting to the hosting cluster
    async fn connection_handle(&self) -> Result<String, Error>;
}
