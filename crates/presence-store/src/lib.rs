//! presence-store: SQLite persistence for attendance.
//!
//! One `attendance` row per identity per date (enforced by a UNIQUE constraint)
//! and an `employees` directory. All access goes through a single mutex-guarded
//! connection, so ledger transitions for the same identity are serialized.

mod employees;
mod ledger;
mod reports;

pub use employees::{Employee, EmployeeDetails};
pub use reports::{AttendanceSummary, PurgeCounts};

use presence_core::{LedgerError, TransitionError};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIME_FORMAT: &str = "%H:%M:%S";
pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid transition: {0}")]
    Transition(#[from] TransitionError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transition(t) => LedgerError::InvalidTransition(t),
            other => LedgerError::storage(other),
        }
    }
}

/// SQLite-backed attendance ledger and employee directory.
pub struct AttendanceStore {
    conn: Mutex<Connection>,
}

impl AttendanceStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        ensure_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS employees (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE,
          email TEXT NOT NULL DEFAULT '',
          phone TEXT NOT NULL DEFAULT '',
          department TEXT NOT NULL DEFAULT '',
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendance (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          employee_id INTEGER REFERENCES employees(id) ON DELETE SET NULL,
          name TEXT NOT NULL,
          date TEXT NOT NULL,
          time_in TEXT NOT NULL,
          time_out TEXT,
          status TEXT NOT NULL DEFAULT 'Present',
          created_at TEXT NOT NULL,
          UNIQUE(name, date)
        );

        CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
        "#,
    )?;
    Ok(())
}

pub(crate) fn parse_text<T>(
    idx: usize,
    value: String,
    parse: impl FnOnce(&str) -> chrono::ParseResult<T>,
) -> rusqlite::Result<T> {
    parse(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/attendance.db");
        AttendanceStore::open(&path).unwrap();
        assert!(path.exists());
        // Re-opening an existing database keeps the schema idempotent.
        AttendanceStore::open(&path).unwrap();
    }

    #[test]
    fn test_store_error_maps_transitions() {
        let err: LedgerError = StoreError::Transition(TransitionError::NotCheckedIn).into();
        assert_eq!(err.transition(), Some(TransitionError::NotCheckedIn));

        let err: LedgerError = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).into();
        assert!(matches!(err, LedgerError::Storage(_)));
    }
}
