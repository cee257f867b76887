//! Shared setup for kind-backed tests

use std::sync::Arc;

use kube::Client;
use runnerset::cluster::{client_from_kubeconfig, ClusterProvisioner, KindProvisioner};

/// Name of the cluster every kind-backed test shares
pub const TEST_CLUSTER: &str = "runnerset-integration-test";

/// Provisioner for the shared test cluster
pub fn provisioner() -> Arc<KindProvisioner> {
    Arc::new(KindProvisioner::new(TEST_CLUSTER))
}

/// Create the shared test cluster if needed and connect to it
pub async fn ensure_test_cluster() -> (Arc<KindProvisioner>, Client) {
    let provisioner = provisioner();
    if !provisioner.exists().await.expect("kind should be installed") {
        provisioner
            .create()
            .await
            .expect("failed to create kind cluster");
    }
    let kubeconfig = provisioner
        .connection_handle()
        .await
        .expect("kubeconfig for test cluster");
    let client = client_from_kubeconfig(Some(&kubeconfig))
        .await
        .expect("client for test cluster");
    (provisioner, client)
}
