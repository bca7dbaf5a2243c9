use crate::status::StationStatus;
use chrono::Local;
use hardhat_ledger::AttendanceLedger;
use std::path::PathBuf;
use tokio::sync::watch;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Hardhat1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Hardhat1";

/// D-Bus interface for the hardhat station daemon.
///
/// Bus name: org.freedesktop.Hardhat1
/// Object path: /org/freedesktop/Hardhat1
pub struct HardhatService {
    status: watch::Receiver<StationStatus>,
    db_path: PathBuf,
}

impl HardhatService {
    pub fn new(status: watch::Receiver<StationStatus>, db_path: PathBuf) -> Self {
        Self { status, db_path }
    }
}

#[interface(name = "org.freedesktop.Hardhat1")]
impl HardhatService {
    /// Live station status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.status.borrow().clone();
        serde_json::to_string(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Today's attendance records as a JSON array, ordered by name.
    async fn attendance_today(&self) -> zbus::fdo::Result<String> {
        tracing::debug!("attendance_today requested");
        let db_path = self.db_path.clone();
        let records = tokio::task::spawn_blocking(move || {
            let ledger = AttendanceLedger::open(&db_path)?;
            ledger.records_on(Local::now().date_naive())
        })
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("ledger task failed: {e}")))?
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
