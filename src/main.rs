//! cambus - camera-bus supervisor
//!
//! Main entry point: wire the bus, the object store, the driver registry,
//! the uplink manager and the media-config generators into the supervisor,
//! then serve until INT/TERM.

use cambus::drivers::DriverRegistry;
use cambus::engines::EngineManager;
use cambus::mediamtx::MediaConfigGenerator;
use cambus::mqtt::BusClient;
use cambus::state::AppConfig;
use cambus::storage::{S3Store, SnapshotStore};
use cambus::supervisor::Supervisor;
use cambus::uplink::UplinkManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    if dotenvy::dotenv().is_err() {
        tracing::debug!("no .env file found");
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cambus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting cambus v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    tracing::info!(
        base_topic = %config.base_topic,
        mqtt_host = %config.mqtt_host,
        mqtt_port = config.mqtt_port,
        "configuration loaded"
    );

    // Object store is optional: without it events go out without snapshots.
    let store: Option<Arc<dyn SnapshotStore>> = match S3Store::from_env().await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(error = %e, "object store not initialized, snapshots disabled");
            None
        }
    };

    // The bus is mandatory; failing to connect is fatal.
    let bus = BusClient::connect(&config).await?;

    let engines = Arc::new(EngineManager::from_env());
    let registry = Arc::new(DriverRegistry::with_builtin_drivers());
    let uplink = UplinkManager::from_env();

    let mut generators = Vec::new();
    if let Some(generator) = MediaConfigGenerator::from_proxy_env() {
        tracing::info!("proxy media-config generator enabled");
        generators.push(Arc::new(generator));
    }
    if let Some(generator) = MediaConfigGenerator::from_central_env() {
        tracing::info!("central media-config generator enabled");
        generators.push(Arc::new(generator));
    }

    let supervisor = Supervisor::new(
        bus.clone(),
        &config,
        engines,
        Some(uplink.clone()),
        registry,
        store,
        generators,
    );

    let cancel = CancellationToken::new();

    let uplink_cancel = cancel.clone();
    let uplink_task = uplink.clone();
    tokio::spawn(async move {
        uplink_task.run(uplink_cancel).await;
    });

    let supervisor_cancel = cancel.clone();
    let supervisor_task = tokio::spawn(async move {
        if let Err(e) = supervisor.run(supervisor_cancel).await {
            tracing::error!(error = %e, "supervisor ended with error");
        }
    });

    shutdown_signal().await;
    tracing::info!("signal received, shutting down");
    cancel.cancel();

    // Give workers and uplinks a moment to finish their teardown.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), supervisor_task).await;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
