//! hardhat-ledger — durable once-per-day attendance records.
//!
//! One row per (identity, local calendar day). The `UNIQUE(name, day)`
//! constraint plus `ON CONFLICT DO NOTHING` makes the insert atomic, so
//! several stations may write to the same database file.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use hardhat_core::store::{AttendanceStore, PersistenceError};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DB_FILE: &str = "attendance.db";

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open attendance database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt attendance row: {0}")]
    Corrupt(String),
}

impl From<LedgerError> for PersistenceError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::CreateDir { .. } | LedgerError::Open { .. } => {
                PersistenceError::Unavailable(e.to_string())
            }
            LedgerError::Sqlite(_) | LedgerError::Corrupt(_) => PersistenceError::Write(e.to_string()),
        }
    }
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub day: NaiveDate,
    pub time: NaiveTime,
}

/// Default database location: `$XDG_DATA_HOME/hardhat/attendance.db`.
pub fn default_db_path() -> PathBuf {
    hardhat_core::data_dir().join(DB_FILE)
}

/// SQLite-backed attendance ledger. Owns its connection; dropping or
/// calling [`AttendanceLedger::close`] releases it.
pub struct AttendanceLedger {
    conn: Connection,
}

impl AttendanceLedger {
    /// Open (creating if needed) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|source| LedgerError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        // SQLite opens lazily; failures on the first statement are open failures too.
        let ledger = Self::with_connection(conn).map_err(|e| match e {
            LedgerError::Sqlite(source) => LedgerError::Open {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        tracing::info!(path = %path.display(), "attendance ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let ledger = Self { conn };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn ensure_schema(&self) -> Result<(), LedgerError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS attendance (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              day TEXT NOT NULL,
              time TEXT NOT NULL,
              UNIQUE(name, day)
            );

            CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance(day);
            "#,
        )?;
        Ok(())
    }

    /// Record `identity` for the current local day unless already present.
    pub fn mark_if_absent_today(&mut self, identity: &str) -> Result<bool, LedgerError> {
        self.mark_if_absent_at(identity, Local::now().naive_local())
    }

    /// Record `identity` for the day of `at` unless already present.
    ///
    /// Returns `true` when a row was inserted.
    pub fn mark_if_absent_at(&mut self, identity: &str, at: NaiveDateTime) -> Result<bool, LedgerError> {
        let day = at.date().format(DAY_FORMAT).to_string();
        let time = at.time().format(TIME_FORMAT).to_string();
        let inserted = self.conn.execute(
            "INSERT INTO attendance (name, day, time) VALUES (?1, ?2, ?3)
             ON CONFLICT(name, day) DO NOTHING",
            params![identity, day, time],
        )?;
        if inserted > 0 {
            tracing::info!(identity, %day, %time, "attendance recorded");
        } else {
            tracing::debug!(identity, %day, "attendance already recorded");
        }
        Ok(inserted > 0)
    }

    /// Records for one calendar day, ordered by name then time.
    pub fn records_on(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, day, time FROM attendance WHERE day = ?1 ORDER BY name, time")?;
        let rows = stmt.query_map(params![day.format(DAY_FORMAT).to_string()], raw_row)?;
        collect_records(rows)
    }

    /// Every record, ordered by name then time.
    pub fn all_records(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, day, time FROM attendance ORDER BY name, day, time")?;
        let rows = stmt.query_map([], raw_row)?;
        collect_records(rows)
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<(), LedgerError> {
        self.conn.close().map_err(|(_, e)| LedgerError::Sqlite(e))?;
        tracing::info!("attendance ledger closed");
        Ok(())
    }
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<(String, String, String)>>,
) -> Result<Vec<AttendanceRecord>, LedgerError> {
    let mut out = Vec::new();
    for row in rows {
        let (name, day, time) = row?;
        let day = NaiveDate::parse_from_str(&day, DAY_FORMAT)
            .map_err(|e| LedgerError::Corrupt(format!("{name}: day {day:?}: {e}")))?;
        let time = NaiveTime::parse_from_str(&time, TIME_FORMAT)
            .map_err(|e| LedgerError::Corrupt(format!("{name}: time {time:?}: {e}")))?;
        out.push(AttendanceRecord { name, day, time });
    }
    Ok(out)
}

impl AttendanceStore for AttendanceLedger {
    fn mark_if_absent_today(&mut self, identity: &str) -> Result<bool, PersistenceError> {
        AttendanceLedger::mark_if_absent_today(self, identity).map_err(PersistenceError::from)
    }
}
