//! Machina controller - reconciles VirtualMachine resources against a remote VM backend

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use machina::controller::{Context, ControllerConfig, LogRecorder, VmController, VmWriterImpl};
use machina::crd::VirtualMachine;
use machina::informer::{spawn_informer, StoreLister};
use machina::manager::FakeVmManager;
use machina::queue::{BackoffConfig, WorkQueue};
use machina::{CONTROLLER_NAME, DEFAULT_WORKER_COUNT};

/// Machina - Kubernetes controller for externally managed virtual machines
#[derive(Parser, Debug)]
#[command(name = "machina", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "MACHINA_WORKERS", default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Status-sync period in seconds
    #[arg(long, env = "MACHINA_SYNC_PERIOD_SECS", default_value_t = 1)]
    sync_period_secs: u64,

    /// Base delay of the work-queue failure backoff, in milliseconds
    #[arg(long, env = "MACHINA_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Ceiling of the work-queue failure backoff, in seconds
    #[arg(long, env = "MACHINA_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client speaks TLS through rustls; pin one crypto provider
    // before anything else touches it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&VirtualMachine::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli).await
}

/// Register the VirtualMachine type with the cluster
///
/// The controller installs its own CRD on startup using server-side apply,
/// so the installed schema always matches the running binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing VirtualMachine CRD...");
    crds.patch(
        "virtualmachines.machina.dev",
        &params,
        &Patch::Apply(&VirtualMachine::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install VirtualMachine CRD: {}", e))?;

    Ok(())
}

/// Wire the informer, queue, and controller together and run until ctrl-c
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Machina controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let queue = WorkQueue::new(BackoffConfig {
        base_delay: Duration::from_millis(cli.backoff_base_ms),
        max_delay: Duration::from_secs(cli.backoff_max_secs),
    });

    let api: Api<VirtualMachine> = Api::all(client.clone());
    let (store, adapter) = spawn_informer(api, queue.clone());

    tracing::info!("Waiting for initial cache sync");
    store
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("Cache never became ready: {}", e))?;

    // The remote backend is deployment-specific; the no-op reference double
    // stands in until one is wired here.
    let ctx = Arc::new(Context::new(
        Arc::new(StoreLister::new(store)),
        Arc::new(VmWriterImpl::new(client)),
        Arc::new(FakeVmManager::new()),
        Arc::new(LogRecorder),
    ));

    let controller = VmController::new(
        ctx,
        queue,
        ControllerConfig {
            workers: cli.workers,
            sync_period: Duration::from_secs(cli.sync_period_secs),
        },
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    controller.run(shutdown).await;
    adapter.abort();

    tracing::info!("Machina controller shutting down");
    Ok(())
}
