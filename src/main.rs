//! hotswap - keeps an HTTP service reachable while its code is replaced
//!
//! Serves public traffic on `--port`, forwarding it to the active worker, and
//! exposes the reload/upload/fetch/shutdown control endpoints on the same listener.
mod config;

use anyhow::{Context, Result};
use clap::Parser as _;
use config::{BackendKind, Config};
use hotswap::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    staging::{ArtifactStaging, DirectorySource},
    supervisor::{Supervisor, SupervisorOptions},
    worker::{Backend, LibraryBackend, ProcessBackend},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
#[instrument]
pub async fn main() -> Result<()> {
    let config = Config::parse();

    let filter = if config.verbose {
        EnvFilter::new("hotswap=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = config.validate()?;
    info!("Starting hotswap with config: {:?}", config);

    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Process => Arc::new(
            ProcessBackend::builder()
                .port(config.worker_port)
                .ready_timeout(config.ready_timeout())
                .stop_timeout(config.grace_period())
                .build(),
        ),
        BackendKind::Library => Arc::new(LibraryBackend),
    };

    let staging = Arc::new(ArtifactStaging::new(&config.staging_dir).with_context(|| {
        format!(
            "Failed to prepare staging directory {}",
            config.staging_dir.display()
        )
    })?);

    let options = SupervisorOptions::builder()
        .grace_period(config.grace_period())
        .spawn_retry_delay(config.spawn_retry_delay())
        .channel_capacity(config.channel_capacity)
        .maybe_initial_artifact(config.artifact.clone())
        .build();
    let supervisor = Supervisor::new(backend, Arc::clone(&staging), options);
    let handle = supervisor.handle();

    let mut app_state = AppState::new(handle.clone(), staging);
    if let Some(source_dir) = &config.source_dir {
        info!("Fetch endpoint staging from {}", source_dir.display());
        app_state = app_state.with_source(Arc::new(DirectorySource::new(source_dir)));
    }

    let mut router = build_router(app_state, &config.control_paths());

    if config.metrics {
        let (prometheus_layer, prometheus_handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        let metrics_router = build_metrics_router(prometheus_handle);
        let bind_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind metrics listener to {bind_addr}"))?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router).await {
                error!("Metrics server error: {}", e);
            }
        });
        info!("Metrics endpoint enabled on {}", bind_addr);
        router = router.layer(prometheus_layer);
    } else {
        info!("Metrics endpoint disabled");
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!("hotswap listening on {}", bind_addr);

    let draining = handle.clone();
    tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { draining.draining().await })
            .await;
        if let Err(e) = served {
            error!("Server error: {}", e);
        }
    });

    // Ctrl-C takes the same path as the shutdown endpoint.
    let control = handle.control.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Received ctrl-c");
        let _ = control.shutdown().await;
    });

    // Returns only after an explicit shutdown has been drained.
    supervisor.supervise().await;
    info!("Exiting");
    Ok(())
}
