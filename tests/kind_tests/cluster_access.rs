//! Stories about reaching the hosting cluster and tracking applied apps

use runnerset::cluster::{ApplyCause, ClusterProvisioner, KubeApplier, ManifestApplier};
use runnerset::Error;

use super::helpers::{ensure_test_cluster, TEST_CLUSTER};

const PLAIN_APP: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: runnerset-it-plain
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: plain
  namespace: runnerset-it-plain
data:
  greeting: hello
"#;

/// Story: the provisioner reports the cluster it just ensured
#[tokio::test]
#[ignore]
async fn story_cluster_is_listed_after_ensure() {
    let (provisioner, _) = ensure_test_cluster().await;
    assert_eq!(provisioner.name(), TEST_CLUSTER);
    assert!(provisioner.exists().await.unwrap());
}

/// Story: an app applied by name can be listed and deleted by name
#[tokio::test]
#[ignore]
async fn story_app_round_trip() {
    let (_, client) = ensure_test_cluster().await;
    let applier = KubeApplier::new(client);
    let _ = applier.delete("it-plain").await;

    applier.apply("it-plain", PLAIN_APP.as_bytes()).await.unwrap();
    let apps = applier.list().await.unwrap();
    let app = apps.iter().find(|a| a.name == "it-plain").expect("app listed");
    assert_eq!(app.kind, "ConfigMap");

    applier.delete("it-plain").await.unwrap();
    assert!(!applier
        .list()
        .await
        .unwrap()
        .iter()
        .any(|a| a.name == "it-plain"));
}

/// Story: deleting an app that was never applied reports NotFound
#[tokio::test]
#[ignore]
async fn story_unknown_app_delete_is_not_found() {
    let (_, client) = ensure_test_cluster().await;
    let applier = KubeApplier::new(client);

    match applier.delete("it-never-applied").await {
        Err(Error::Apply(e)) => assert_eq!(e.cause, ApplyCause::NotFound),
        other => panic!("expected NotFound, got {other:?}"),
    }
}
