//! Daily attendance state machine.
//!
//! Each identity is NOT_PRESENT, CHECKED_IN or CHECKED_OUT for a calendar day.
//! The state is never cached: every decision re-reads it from the [`Ledger`], so
//! a restarted process picks up exactly where the durable records left off.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Status string stored on every record created by a recognition or check-in.
pub const STATUS_PRESENT: &str = "Present";

/// Attendance state of one identity on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DayStatus {
    NotPresent,
    CheckedIn { time_in: NaiveTime },
    CheckedOut { time_in: NaiveTime, time_out: NaiveTime },
}

impl DayStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DayStatus::NotPresent => "not_present",
            DayStatus::CheckedIn { .. } => "checked_in",
            DayStatus::CheckedOut { .. } => "checked_out",
        }
    }
}

/// One identity's attendance row for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceDayRecord {
    pub name: String,
    pub date: NaiveDate,
    pub time_in: NaiveTime,
    pub time_out: Option<NaiveTime>,
    pub status: String,
}

impl AttendanceDayRecord {
    pub fn day_status(&self) -> DayStatus {
        match self.time_out {
            Some(time_out) => DayStatus::CheckedOut { time_in: self.time_in, time_out },
            None => DayStatus::CheckedIn { time_in: self.time_in },
        }
    }
}

/// Filter for [`Ledger::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub name: Option<String>,
}

impl RecordQuery {
    pub fn on(date: NaiveDate) -> Self {
        Self { from: Some(date), to: Some(date), name: None }
    }

    pub fn matches(&self, record: &AttendanceDayRecord) -> bool {
        self.from.map_or(true, |from| record.date >= from)
            && self.to.map_or(true, |to| record.date <= to)
            && self.name.as_deref().map_or(true, |name| record.name == name)
    }
}

/// A ledger write that would break the one-record-per-day invariant.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("already checked in today")]
    AlreadyCheckedIn,
    #[error("already checked out today")]
    AlreadyCheckedOut,
    #[error("not checked in today")]
    NotCheckedIn,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),
    #[error("ledger storage failure: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        LedgerError::Storage(Box::new(err))
    }

    pub fn transition(&self) -> Option<TransitionError> {
        match self {
            LedgerError::InvalidTransition(t) => Some(*t),
            LedgerError::Storage(_) => None,
        }
    }
}

/// Durable store of daily attendance records.
///
/// Implementations must serialize `open_record`/`close_record` for the same
/// identity and date so concurrent callers cannot create a second record.
pub trait Ledger: Send + Sync {
    /// Attendance state of `name` on `date`.
    fn status(&self, name: &str, date: NaiveDate) -> Result<DayStatus, LedgerError>;

    /// Create the record for `time_in.date()`. Fails if one already exists.
    fn open_record(&self, name: &str, time_in: NaiveDateTime) -> Result<(), LedgerError>;

    /// Set `time_out` on the open record for `time_out.date()`.
    fn close_record(&self, name: &str, time_out: NaiveDateTime) -> Result<(), LedgerError>;

    /// Records matching `filter`, newest date first, then latest time_in first.
    fn query(&self, filter: &RecordQuery) -> Result<Vec<AttendanceDayRecord>, LedgerError>;

    /// Identities with an open record on `date`, earliest arrival first.
    fn checked_in(&self, date: NaiveDate) -> Result<Vec<AttendanceDayRecord>, LedgerError> {
        let mut open: Vec<_> = self
            .query(&RecordQuery::on(date))?
            .into_iter()
            .filter(|r| r.time_out.is_none())
            .collect();
        open.sort_by_key(|r| r.time_in);
        Ok(open)
    }
}

/// What a recognition or manual checkout did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttendanceOutcome {
    /// A new record was opened.
    CheckedIn { time_in: NaiveDateTime },
    /// The open record was closed.
    CheckedOut { time_in: NaiveTime, time_out: NaiveDateTime },
    /// The day was already complete; nothing was written.
    AlreadyComplete { time_in: NaiveTime, time_out: NaiveTime },
}

impl AttendanceOutcome {
    /// Status after this outcome.
    pub fn status(&self) -> DayStatus {
        match *self {
            AttendanceOutcome::CheckedIn { time_in } => DayStatus::CheckedIn { time_in: time_in.time() },
            AttendanceOutcome::CheckedOut { time_in, time_out } => DayStatus::CheckedOut {
                time_in,
                time_out: time_out.time(),
            },
            AttendanceOutcome::AlreadyComplete { time_in, time_out } => {
                DayStatus::CheckedOut { time_in, time_out }
            }
        }
    }

    pub fn wrote_ledger(&self) -> bool {
        !matches!(self, AttendanceOutcome::AlreadyComplete { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttendanceOutcome::CheckedIn { .. } => "checked_in",
            AttendanceOutcome::CheckedOut { .. } => "checked_out",
            AttendanceOutcome::AlreadyComplete { .. } => "already_complete",
        }
    }
}

/// Decides the ledger write for each accepted recognition event.
#[derive(Clone)]
pub struct AttendanceStateMachine {
    ledger: Arc<dyn Ledger>,
}

impl AttendanceStateMachine {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn status(&self, name: &str, date: NaiveDate) -> Result<DayStatus, LedgerError> {
        self.ledger.status(name, date)
    }

    /// Apply a recognition of `name` at `now`.
    pub fn on_recognized(&self, name: &str, now: NaiveDateTime) -> Result<AttendanceOutcome, LedgerError> {
        match self.ledger.status(name, now.date())? {
            DayStatus::NotPresent => {
                self.ledger.open_record(name, now)?;
                tracing::info!(name, time_in = %now, "checked in");
                Ok(AttendanceOutcome::CheckedIn { time_in: now })
            }
            DayStatus::CheckedIn { time_in } => {
                self.ledger.close_record(name, now)?;
                tracing::info!(name, %time_in, time_out = %now, "checked out");
                Ok(AttendanceOutcome::CheckedOut { time_in, time_out: now })
            }
            DayStatus::CheckedOut { time_in, time_out } => {
                tracing::debug!(name, %time_in, %time_out, "attendance already complete today");
                Ok(AttendanceOutcome::AlreadyComplete { time_in, time_out })
            }
        }
    }

    /// Operator-initiated checkout. Only valid from CHECKED_IN.
    pub fn manual_checkout(&self, name: &str, now: NaiveDateTime) -> Result<AttendanceOutcome, LedgerError> {
        match self.ledger.status(name, now.date())? {
            DayStatus::NotPresent => Err(TransitionError::NotCheckedIn.into()),
            DayStatus::CheckedOut { .. } => Err(TransitionError::AlreadyCheckedOut.into()),
            DayStatus::CheckedIn { time_in } => {
                self.ledger.close_record(name, now)?;
                tracing::info!(name, %time_in, time_out = %now, "manual checkout");
                Ok(AttendanceOutcome::CheckedOut { time_in, time_out: now })
            }
        }
    }
}

/// In-process ledger. Durable only for the life of the process.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<BTreeMap<(String, NaiveDate), AttendanceDayRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn status(&self, name: &str, date: NaiveDate) -> Result<DayStatus, LedgerError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .get(&(name.to_string(), date))
            .map_or(DayStatus::NotPresent, AttendanceDayRecord::day_status))
    }

    fn open_record(&self, name: &str, time_in: NaiveDateTime) -> Result<(), LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (name.to_string(), time_in.date());
        if let Some(existing) = records.get(&key) {
            return Err(match existing.time_out {
                None => TransitionError::AlreadyCheckedIn,
                Some(_) => TransitionError::AlreadyCheckedOut,
            }
            .into());
        }
        records.insert(
            key,
            AttendanceDayRecord {
                name: name.to_string(),
                date: time_in.date(),
                time_in: time_in.time(),
                time_out: None,
                status: STATUS_PRESENT.to_string(),
            },
        );
        Ok(())
    }

    fn close_record(&self, name: &str, time_out: NaiveDateTime) -> Result<(), LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(&(name.to_string(), time_out.date())) {
            Some(record) if record.time_out.is_none() => {
                record.time_out = Some(time_out.time());
                Ok(())
            }
            _ => Err(TransitionError::NotCheckedIn.into()),
        }
    }

    fn query(&self, filter: &RecordQuery) -> Result<Vec<AttendanceDayRecord>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = records.values().filter(|r| filter.matches(r)).cloned().collect();
        out.sort_by(|a, b| b.date.cmp(&a.date).then(b.time_in.cmp(&a.time_in)));
        Ok(out)
    }
}
