use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod sink;
mod station;
mod status;

use dbus_interface::{HardhatService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("hardhatd starting");

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        replay = ?config.replay_dir,
        references = %config.reference_dir.display(),
        db = %config.db_path.display(),
        tolerance = config.tolerance,
        "configuration loaded"
    );

    let station = station::spawn_station(&config)?;
    let status = station.subscribe();

    // Everything after spawn runs under `supervise`, so a failure here still
    // stops the station before the error is returned.
    let serve = async move {
        let _connection = if config.dbus_enabled {
            let service = HardhatService::new(status, config.db_path.clone());
            let connection = zbus::connection::Builder::session()?
                .name(BUS_NAME)?
                .serve_at(OBJECT_PATH, service)?
                .build()
                .await
                .context("failed to register on the session bus (set HARDHAT_DBUS=0 to run without it)")?;
            tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus service registered");
            Some(connection)
        } else {
            tracing::info!("D-Bus disabled via HARDHAT_DBUS=0");
            None
        };

        tracing::info!("hardhatd ready");
        tokio::signal::ctrl_c().await?;
        tracing::info!("hardhatd shutting down");
        Ok::<(), anyhow::Error>(())
    };

    let (stats, outcome) = station::supervise(station, serve).await;
    tracing::info!(
        frames = stats.frames_rendered,
        recognized = stats.recognized_count,
        "hardhatd stopped"
    );

    outcome
}
