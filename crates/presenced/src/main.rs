use anyhow::{Context, Result};
use presence_core::{SystemClock, TemplateRegistry};
use presence_store::AttendanceStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use service::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "presenced starting");

    let config = Config::from_env().context("loading configuration")?;
    let registry = Arc::new(TemplateRegistry::open(config.registry_path.clone()));
    let store = Arc::new(
        AttendanceStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let detector = presence_core::detector::from_kind(&config.detector, &config.model_path_str())
        .with_context(|| format!("loading {} detector", config.detector))?;
    tracing::info!(detector = %config.detector, identities = registry.len(), "models ready");

    let daemon = Arc::new(Daemon::new(
        config.clone(),
        registry,
        store,
        detector,
        Arc::new(SystemClock),
    ));
    let events = daemon.subscribe();

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(Arc::clone(&daemon)))?
        .build()
        .await
        .context("registering on D-Bus")?;
    tracing::info!(bus = ?config.bus, name = BUS_NAME, "D-Bus service registered");

    let forwarder = tokio::spawn(dbus_interface::forward_events(connection.clone(), events));

    if config.autostart {
        let d = Arc::clone(&daemon);
        match tokio::task::spawn_blocking(move || d.start()).await? {
            Ok(_) => tracing::info!("recognition loop autostarted"),
            Err(e) => tracing::error!(error = %e, "autostart failed; use `presence start` to retry"),
        }
    }

    tracing::info!("presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    let d = Arc::clone(&daemon);
    if let Some(reason) = tokio::task::spawn_blocking(move || d.stop()).await?? {
        tracing::info!(%reason, "recognition loop stopped");
    }
    forwarder.abort();

    Ok(())
}
