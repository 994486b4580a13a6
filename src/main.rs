use anyhow::Result;
use clap::Parser;
use ldes_orchestrator::config::ControllerConfig;
use ldes_orchestrator::events::{event_channel, ControllerEvent};
use ldes_orchestrator::monitor::spawn_health_monitor;
use ldes_orchestrator::reconciler::Reconciler;
use ldes_orchestrator::runtime::{DockerClient, RuntimeClient};
use ldes_orchestrator::watcher::{scan, spawn_config_watcher};
use ldes_orchestrator::{lock, shutdown};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

const LOCK_RETRIES: u32 = 5;
const LOCK_BACKOFF: Duration = Duration::from_secs(2);

/// LDES feed orchestrator: keeps one consumer container running per feed
/// definition in the config directory.
#[derive(Parser)]
#[command(
    name = "ldes-orchestrator",
    about = "Supervises LDES consumer workers from declarative feed configs"
)]
struct Args {
    /// Directory holding the feed definition files (*.yml, *.yaml)
    config_dir: PathBuf,

    /// Worker image (overrides LDES2SPARQL_IMAGE)
    #[arg(long)]
    image: Option<String>,

    /// Container network to attach workers to (overrides DOCKER_NETWORK)
    #[arg(long)]
    network: Option<String>,

    /// Compose project label applied to workers (overrides COMPOSE_PROJECT_NAME)
    #[arg(long)]
    project: Option<String>,

    /// Root directory for per-feed state and diagnostics (overrides LDES_STATE_ROOT)
    #[arg(long)]
    state_root: Option<PathBuf>,

    /// Lock file path (overrides LDES_LOCK_FILE)
    #[arg(long)]
    lock_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting LDES orchestrator");

    let mut config = ControllerConfig::from_env();
    if let Some(image) = args.image {
        config.image = image;
    }
    if let Some(network) = args.network {
        config.network = network;
    }
    if let Some(project) = args.project {
        config.project = project;
    }
    if let Some(state_root) = args.state_root {
        config.state_root = state_root;
    }
    if let Some(lock_file) = args.lock_file {
        config.lock_path = lock_file;
    }
    if !args.config_dir.is_dir() {
        anyhow::bail!("Config directory {:?} does not exist", args.config_dir);
    }
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.state_root)?;

    // Single-writer guard: only one controller may manage this deployment.
    let token = lock::acquire(
        &config.lock_path,
        std::process::id(),
        LOCK_RETRIES,
        LOCK_BACKOFF,
    )
    .await?;

    let runtime: Arc<dyn RuntimeClient> = Arc::new(DockerClient::new());
    let (event_tx, event_rx) = event_channel();

    // Load the feed definitions present at startup.
    let (specs, known) = scan(&args.config_dir)?;
    let mut reconciler = Reconciler::new(
        Arc::clone(&config),
        Arc::clone(&runtime),
        event_tx.clone(),
        event_rx,
    );
    reconciler.seed(specs);
    reconciler.adopt_running().await?;

    let monitor_handle = spawn_health_monitor(
        Arc::clone(&runtime),
        reconciler.tracked(),
        config.project.clone(),
        config.poll_interval,
        event_tx.clone(),
    );
    let watcher_handle = spawn_config_watcher(
        args.config_dir.clone(),
        config.debounce,
        known,
        event_tx.clone(),
    );

    let loop_handle = tokio::spawn(reconciler.run());

    // Wait for a termination signal, then push Shutdown into the queue so
    // the reconciler stops dispatching before we tear the workers down.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signo = tokio::select! {
        _ = sigterm.recv() => Signal::SIGTERM as i32,
        _ = sigint.recv() => Signal::SIGINT as i32,
    };
    info!("Received signal {}, shutting down", signo);

    if event_tx.send(ControllerEvent::Shutdown).await.is_err() {
        error!("Reconciler queue already closed");
    }
    monitor_handle.abort();
    watcher_handle.abort();

    let reconciler = loop_handle.await?;
    let handles = reconciler
        .store()
        .actual_handles()
        .cloned()
        .collect::<Vec<_>>();
    let clean = shutdown::stop_all(runtime, handles, config.stop_grace).await;
    if !clean {
        warn!("Some workers did not stop in time");
    }

    if let Err(e) = lock::release(&token) {
        warn!("Could not release lock: {}", e);
    }

    std::process::exit(shutdown::exit_code(clean, signo));
}
