//! Hosting cluster lifecycle via `kind`

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::Error;

use super::{ApplyCause, ApplyError, ClusterProvisioner};

/// Default name of the hosting cluster
pub const DEFAULT_CLUSTER_NAME: &str = "runnerset";

/// ClusterProvisioner that shells out to the `kind` binary
#[derive(Clone, Debug)]
pub struct KindProvisioner {
    name: String,
    binary: String,
    host_mounts: Vec<String>,
}

impl Default for KindProvisioner {
    fn default() -> Self {
        Self::new(DEFAULT_CLUSTER_NAME)
    }
}

impl KindProvisioner {
    /// Provision a kind cluster with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: "kind".to_string(),
            host_mounts: Vec::new(),
        }
    }

    /// Use another `kind` executable
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Mount a host directory into the node at the same path
    ///
    /// Host-backed cache volumes resolve inside the node container, so the
    /// cache root has to be mounted through for caches to outlive the node.
    pub fn with_host_mount(mut self, path: impl Into<String>) -> Self {
        self.host_mounts.push(path.into());
        self
    }

    /// Cluster config passed to `kind create cluster`
    pub fn cluster_config(&self) -> String {
        let mut config = String::from(
            "kind: Cluster\napiVersion: kind.x-k8s.io/v1alpha4\nnodes:\n- role: control-plane\n",
        );
        if !self.host_mounts.is_empty() {
            config.push_str("  extraMounts:\n");
            for path in &self.host_mounts {
                config.push_str(&format!("  - hostPath: {path}\n    containerPath: {path}\n"));
            }
        }
        config
    }

    fn failure(&self, cause: ApplyCause, message: String) -> Error {
        ApplyError::new(&self.name, cause, message).into()
    }

    async fn run(&self, args: &[&str]) -> Result<Output, Error> {
        debug!(binary = %self.binary, ?args, "Running kind");
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                self.failure(
                    ApplyCause::ClusterUnreachable,
                    format!("failed to run {}: {e}", self.binary),
                )
            })
    }

    fn check(&self, what: &str, output: &Output) -> Result<(), Error> {
        if output.status.success() {
            return Ok(());
        }
        Err(self.failure(
            ApplyCause::Other,
            format!("{what} failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
        ))
    }
}

/// Cluster names listed by `kind get clusters`
fn parse_cluster_list(stdout: &str) -> Vec<&str> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("No kind clusters"))
        .collect()
}

#[async_trait]
impl ClusterProvisioner for KindProvisioner {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn exists(&self) -> Result<bool, Error> {
        let output = self.run(&["get", "clusters"]).await?;
        self.check("kind get clusters", &output)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_cluster_list(&stdout).contains(&self.name.as_str()))
    }

    #[instrument(skip(self), fields(cluster = %self.name))]
    async fn create(&self) -> Result<(), Error> {
        info!("Creating kind cluster");
        let mut child = Command::new(&self.binary)
            .args(["create", "cluster", "--name", &self.name, "--config", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                self.failure(
                    ApplyCause::ClusterUnreachable,
                    format!("failed to run {}: {e}", self.binary),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.cluster_config().as_bytes())
                .await
                .map_err(|e| self.failure(ApplyCause::Other, format!("failed to write kind config: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.failure(ApplyCause::Other, format!("kind create cluster: {e}")))?;
        self.check("kind create cluster", &output)?;
        info!("Kind cluster created");
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.name))]
    async fn delete(&self) -> Result<(), Error> {
        let output = self.run(&["delete", "cluster", "--name", &self.name]).await?;
        self.check("kind delete cluster", &output)?;
        info!("Kind cluster deleted");
        Ok(())
    }

    async fn connection_handle(&self) -> Result<String, Error> {
        if !self.exists().await? {
            return Err(Error::ClusterMissing(self.name.clone()));
        }
        let output = self.run(&["get", "kubeconfig", "--name", &self.name]).await?;
        self.check("kind get kubeconfig", &output)?;
        String::from_utf8(output.stdout)
            .map_err(|e| Error::serialization(format!("kubeconfig is not UTF-8: {e}")))
    }
}
