//! Stories about bootstrapping the controller and converging runners

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use tokio_util::sync::CancellationToken;

use runnerset::bootstrap::{BootstrapState, ControllerBootstrapper, CONTROLLER_CRD};
use runnerset::cluster::{KubeApplier, KubeSchemaProbe, SchemaProbe};
use runnerset::config::Settings;
use runnerset::installation::{ContainerMode, InstallationSpec};
use runnerset::reconcile::{ConvergeAction, Reconciler};
use runnerset::store::{ConfigStore, MemoryConfigStore};
use runnerset::template::TemplateCompiler;

use super::helpers::ensure_test_cluster;

fn settings() -> Settings {
    Settings::default().with_bootstrap_timing(Duration::from_secs(2), Duration::from_secs(180))
}

/// Story: bootstrapping an empty cluster ends with the CRD established
#[tokio::test]
#[ignore]
async fn story_controller_bootstrap_establishes_crd() {
    let (_, client) = ensure_test_cluster().await;
    let probe = Arc::new(KubeSchemaProbe::new(client.clone()));
    let bootstrapper = ControllerBootstrapper::new(
        Arc::new(KubeApplier::new(client)),
        probe.clone(),
        Arc::new(TemplateCompiler::new(settings())),
    );

    let state = bootstrapper
        .ensure_ready(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(state, BootstrapState::Ready);
    assert!(probe.schema_present(CONTROLLER_CRD).await.unwrap());
}

/// Story: installations converge, and dropping one deletes it
#[tokio::test]
#[ignore]
async fn story_installations_converge_and_drop() {
    let (provisioner, client) = ensure_test_cluster().await;
    let reconciler = Reconciler::new(
        settings(),
        Arc::new(KubeApplier::new(client.clone())),
        Arc::new(KubeSchemaProbe::new(client.clone())),
        provisioner,
    );

    let mut dind = InstallationSpec::new("it-dind", "https://github.com/acme/app", "ghp_test");
    dind.container_mode = ContainerMode::Dind;
    let plain = InstallationSpec::new("it-standard", "https://github.com/acme/app", "ghp_test");
    let store = MemoryConfigStore::with_installations([dind, plain]);
    let cancel = CancellationToken::new();

    let report = reconciler.reconcile(&store, &cancel).await.unwrap();
    assert!(report.is_success(), "{report:?}");
    assert!(report.outcome("it-dind").is_some());

    store.remove("it-dind").await.unwrap();
    let report = reconciler.reconcile(&store, &cancel).await.unwrap();
    assert!(report.is_success(), "{report:?}");
    assert!(report.names_with(ConvergeAction::Delete).contains(&"it-dind"));
    assert_eq!(
        report.outcome("it-standard").map(|o| o.action),
        Some(ConvergeAction::Replace)
    );

    // the replaced runner set must outlive the old one's finalizer
    tokio::time::sleep(Duration::from_secs(10)).await;
    let runner_set = ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("actions.github.com", "v1alpha1", "AutoscalingRunnerSet"),
        "autoscalingrunnersets",
    );
    let sets: Api<DynamicObject> = Api::namespaced_with(client, "arc-runners", &runner_set);
    let live = sets.get_opt("it-standard").await.unwrap().expect("runner set still deployed");
    assert!(live.metadata.deletion_timestamp.is_none());
}
