use anyhow::{Context, Result};
use clockface_core::{LocalZone, StatisticalExtractor};
use clockface_store::{FsBlobStore, SqliteStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod service;

use config::{BusKind, Config};
use dbus_interface::{AttendanceBus, BUS_NAME, OBJECT_PATH};
use service::{AttendanceService, ServiceSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "clockfaced starting");

    let config = Config::from_env();

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );
    let blobs = Arc::new(
        FsBlobStore::new(&config.upload_dir).with_context(|| {
            format!("failed to prepare upload dir {}", config.upload_dir.display())
        })?,
    );
    tracing::info!(path = %blobs.root().display(), "upload directory ready");

    let zone = LocalZone::from_hours(config.utc_offset_hours)
        .context("invalid CLOCKFACE_UTC_OFFSET_HOURS")?;

    let service = AttendanceService::new(
        Box::new(StatisticalExtractor),
        store.clone(),
        store,
        blobs,
        ServiceSettings {
            thresholds: config.thresholds,
            zone,
            shift: config.shift,
            max_image_bytes: config.max_image_bytes,
        },
    );
    tracing::info!(
        accept = config.thresholds.accept,
        verify = config.thresholds.verify,
        offset = %zone.offset(),
        "attendance service initialized"
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceBus::new(Arc::new(service)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "clockfaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("clockfaced shutting down");

    Ok(())
}
