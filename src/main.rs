use clc::activity::ActivityTracker;
use clc::api::ApiServer;
use clc::config::Config;
use clc::controller::{ContainerLifecycleController, LifecycleController};
use clc::engine::{ContainerEngine, DockerEngine};
use clc::local_runner::LocalProcessRunner;
use clc::null_controller::NullController;
use clc::ports::PortRegistry;
use clc::reconciler::Reconciler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("failed to load configuration from {}: {e}, falling back to defaults", config_path.display());
        Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    info!(path = %config_path.display(), "configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (controller, reconcile_task): (Arc<dyn LifecycleController>, Option<tokio::task::JoinHandle<()>>) =
        if config.containerization_enabled {
            let engine: Arc<dyn ContainerEngine> = Arc::new(
                DockerEngine::connect(None, config.engine)
                    .await
                    .map_err(|e| {
                        error!(error = %e, "failed to connect to the container engine");
                        e
                    })?,
            );
            let ports = Arc::new(PortRegistry::new(&config));
            let activity = Arc::new(ActivityTracker::new(config.net_io_delta_threshold_bytes));
            let controller = Arc::new(ContainerLifecycleController::new(
                engine.clone(),
                ports.clone(),
                activity,
                config.clone(),
            ));

            let reconciler = Arc::new(Reconciler::new(
                engine,
                ports,
                controller.clone(),
                config.reconcile_interval(),
                config.idle_timeout(),
            ));
            let handle = tokio::spawn(async move { reconciler.run().await });

            (controller as Arc<dyn LifecycleController>, Some(handle))
        } else if config.local_process_fallback {
            info!("containerization disabled: using the local-process fallback runner");
            (Arc::new(LocalProcessRunner::new(config.clone())) as Arc<dyn LifecycleController>, None)
        } else {
            info!("containerization disabled: all write operations will return ContainerizationDisabled");
            (Arc::new(NullController) as Arc<dyn LifecycleController>, None)
        };

    let api = Arc::new(ApiServer::new(
        controller,
        config.bind_addr.parse().map_err(|e| anyhow::anyhow!("invalid bind_addr '{}': {e}", config.bind_addr))?,
        PathBuf::from(&config.apps_root),
        shutdown_rx.clone(),
    ));

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "controller API server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down");
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = reconcile_task {
        handle.abort();
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        engine = ?config.engine,
        containerization_enabled = config.containerization_enabled,
        bind_addr = %config.bind_addr,
        "container lifecycle controller starting"
    );
    info!(
        base_port = config.base_port,
        max_port = config.max_port,
        app_port_inside = config.app_port_inside,
        "port range configured"
    );
    info!(
        idle_timeout_ms = config.idle_timeout_ms,
        reconcile_interval_ms = config.reconcile_interval_ms,
        startup_timeout_ms = config.startup_timeout_ms,
        "lifecycle timing configured"
    );
}
