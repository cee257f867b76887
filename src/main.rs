//! runnerset - converge a kind cluster onto declared CI runner installations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runnerset::cluster::{
    client_from_kubeconfig, ClusterProvisioner, KindProvisioner, KubeApplier, KubeSchemaProbe,
    DEFAULT_CLUSTER_NAME,
};
use runnerset::config::{
    Settings, DEFAULT_CONTROLLER_APP, DEFAULT_CONTROLLER_NAMESPACE, DEFAULT_RUNNER_NAMESPACE,
};
use runnerset::installation::expand;
use runnerset::reconcile::Reconciler;
use runnerset::store::{ConfigStore, FileConfigStore};
use runnerset::template::TemplateCompiler;

/// runnerset - declarative self-hosted CI runner scale sets
#[derive(Parser, Debug)]
#[command(name = "runnerset", version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Installation store file
    #[arg(
        short = 'f',
        long = "store",
        env = "RUNNERSET_STORE",
        default_value = "runnerset.yaml",
        global = true
    )]
    store: PathBuf,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the compiled manifest of one or all instances
    Render {
        /// Only render instances of this installation
        installation: Option<String>,
    },

    /// Run one convergence pass against the hosting cluster
    ///
    /// Exits non-zero when any instance failed to converge.
    Reconcile(ReconcileArgs),
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    /// Name of the kind hosting cluster
    #[arg(long, env = "RUNNERSET_CLUSTER", default_value = DEFAULT_CLUSTER_NAME)]
    cluster: String,

    /// Create the hosting cluster when it does not exist
    #[arg(long)]
    create_cluster: bool,

    /// Path to the kind executable
    #[arg(long, env = "RUNNERSET_KIND", default_value = "kind")]
    kind_binary: String,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    /// Namespace for runner scale sets
    #[arg(long, env = "RUNNERSET_RUNNER_NAMESPACE", default_value = DEFAULT_RUNNER_NAMESPACE, global = true)]
    runner_namespace: String,

    /// Namespace for the runner controller
    #[arg(long, env = "RUNNERSET_CONTROLLER_NAMESPACE", default_value = DEFAULT_CONTROLLER_NAMESPACE, global = true)]
    controller_namespace: String,

    /// App name the controller manifest is applied under
    #[arg(long, env = "RUNNERSET_CONTROLLER_APP", default_value = DEFAULT_CONTROLLER_APP, global = true)]
    controller_app: String,

    /// Runner controller image
    #[arg(long, env = "RUNNERSET_CONTROLLER_IMAGE", global = true)]
    controller_image: Option<String>,

    /// Runner image
    #[arg(long, env = "RUNNERSET_RUNNER_IMAGE", global = true)]
    runner_image: Option<String>,

    /// Docker engine image for dind mode
    #[arg(long, env = "RUNNERSET_DIND_IMAGE", global = true)]
    dind_image: Option<String>,

    /// Storage class for the work volume (cluster default when unset)
    #[arg(long, env = "RUNNERSET_WORK_STORAGE_CLASS", global = true)]
    work_storage_class: Option<String>,

    /// Size of the work volume
    #[arg(long, env = "RUNNERSET_WORK_VOLUME_SIZE", global = true)]
    work_volume_size: Option<String>,

    /// Host directory for generated cache sources
    #[arg(long, env = "RUNNERSET_CACHE_ROOT", global = true)]
    cache_root: Option<String>,

    /// Seconds between controller readiness polls
    #[arg(long, env = "RUNNERSET_POLL_INTERVAL_SECS", default_value = "1", global = true)]
    poll_interval_secs: u64,

    /// Seconds to wait for the controller to become ready
    #[arg(long, env = "RUNNERSET_BOOTSTRAP_TIMEOUT_SECS", default_value = "120", global = true)]
    bootstrap_timeout_secs: u64,

    /// Instances converged concurrently
    #[arg(long, env = "RUNNERSET_CONCURRENCY", default_value = "1", global = true)]
    concurrency: usize,
}

impl SettingsArgs {
    fn into_settings(self) -> Settings {
        let mut settings = Settings {
            runner_namespace: self.runner_namespace,
            controller_namespace: self.controller_namespace,
            controller_app: self.controller_app,
            work_storage_class: self.work_storage_class,
            ..Settings::default()
        };
        if let Some(image) = self.controller_image {
            settings.controller_image = image;
        }
        if let Some(image) = self.runner_image {
            settings.runner_image = image;
        }
        if let Some(image) = self.dind_image {
            settings.dind_image = image;
        }
        if let Some(size) = self.work_volume_size {
            settings.work_volume_size = size;
        }
        if let Some(root) = self.cache_root {
            settings = settings.with_cache_host_root(root);
        }
        settings
            .with_bootstrap_timing(
                Duration::from_secs(self.poll_interval_secs),
                Duration::from_secs(self.bootstrap_timeout_secs),
            )
            .with_concurrency(self.concurrency)
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = cli.settings.into_settings();
    let store = FileConfigStore::new(cli.store);

    match cli.command {
        Commands::Render { installation } => render(&store, settings, installation.as_deref()).await,
        Commands::Reconcile(args) => run_reconcile(&store, settings, args).await,
    }
}

/// Print compiled manifests, one YAML stream per instance
async fn render(
    store: &FileConfigStore,
    settings: Settings,
    only: Option<&str>,
) -> anyhow::Result<()> {
    let installations = store
        .list()
        .await
        .with_context(|| format!("failed to read store {}", store.path().display()))?;

    let selected: Vec<_> = installations
        .iter()
        .filter(|spec| only.map_or(true, |name| spec.name == name))
        .collect();
    if let Some(name) = only {
        if selected.is_empty() {
            anyhow::bail!("no installation named '{name}'");
        }
    }

    let compiler = TemplateCompiler::new(settings);
    let mut first = true;
    for spec in selected {
        spec.validate()
            .with_context(|| format!("installation '{}' is invalid", spec.name))?;
        for instance in expand(spec, &compiler.settings().cache_host_root) {
            let manifest = compiler
                .compile(&instance)
                .with_context(|| format!("failed to compile instance '{}'", instance.name))?;
            if !first {
                println!("---");
            }
            first = false;
            print!("{}", manifest.as_yaml());
        }
    }
    Ok(())
}

/// Run one convergence pass, exiting non-zero on any failed instance
async fn run_reconcile(
    store: &FileConfigStore,
    settings: Settings,
    args: ReconcileArgs,
) -> anyhow::Result<()> {
    let provisioner = Arc::new(
        KindProvisioner::new(args.cluster)
            .with_binary(args.kind_binary)
            .with_host_mount(settings.cache_host_root.clone()),
    );

    if args.create_cluster && !provisioner.exists().await? {
        info!(cluster = %provisioner.name(), "Hosting cluster missing, creating it");
        provisioner.create().await?;
    }

    let kubeconfig = provisioner.connection_handle().await?;
    let client = client_from_kubeconfig(Some(&kubeconfig)).await?;

    let reconciler = Reconciler::new(
        settings,
        Arc::new(KubeApplier::new(client.clone())),
        Arc::new(KubeSchemaProbe::new(client)),
        provisioner,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight work");
            trigger.cancel();
        }
    });

    let report = reconciler.reconcile(store, &cancel).await?;
    for outcome in report.failures() {
        warn!(
            app = %outcome.name,
            action = %outcome.action,
            error = outcome.error.as_deref().unwrap_or_default(),
            "Not converged"
        );
    }
    if !report.is_success() {
        anyhow::bail!("{report}");
    }
    info!(%report, "Cluster converged");
    Ok(())
}
