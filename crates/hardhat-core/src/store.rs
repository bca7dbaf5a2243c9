//! Attendance persistence capability consumed by the recognition loop.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("attendance store unavailable: {0}")]
    Unavailable(String),
    #[error("attendance write failed: {0}")]
    Write(String),
}

/// Durable once-per-day attendance record.
///
/// `mark_if_absent_today` must be safe to call redundantly and must never
/// insert twice for the same identity on the same calendar day, even with
/// several writers on one store.
pub trait AttendanceStore: Send {
    /// Returns `true` when a new record was inserted, `false` when the
    /// identity was already recorded today.
    fn mark_if_absent_today(&mut self, identity: &str) -> Result<bool, PersistenceError>;
}
