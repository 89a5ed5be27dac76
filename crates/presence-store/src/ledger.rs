use crate::{parse_text, AttendanceStore, StoreError, DATETIME_FORMAT, DATE_FORMAT, TIME_FORMAT};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use presence_core::attendance::STATUS_PRESENT;
use presence_core::{AttendanceDayRecord, DayStatus, Ledger, LedgerError, RecordQuery, TransitionError};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

const RECORD_COLUMNS: &str = "name, date, time_in, time_out, status";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceDayRecord> {
    Ok(AttendanceDayRecord {
        name: row.get(0)?,
        date: parse_text(1, row.get(1)?, |s| NaiveDate::parse_from_str(s, DATE_FORMAT))?,
        time_in: parse_text(2, row.get(2)?, |s| NaiveTime::parse_from_str(s, TIME_FORMAT))?,
        time_out: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_text(3, s, |s| NaiveTime::parse_from_str(s, TIME_FORMAT)))
            .transpose()?,
        status: row.get(4)?,
    })
}

impl AttendanceStore {
    fn day_record(&self, name: &str, date: NaiveDate) -> Result<Option<AttendanceDayRecord>, StoreError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE name = ?1 AND date = ?2"),
                params![name, date.format(DATE_FORMAT).to_string()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn insert_open(&self, name: &str, time_in: NaiveDateTime) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let date = time_in.format(DATE_FORMAT).to_string();

        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT time_out FROM attendance WHERE name = ?1 AND date = ?2",
                params![name, date],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(None) => return Err(TransitionError::AlreadyCheckedIn.into()),
            Some(Some(_)) => return Err(TransitionError::AlreadyCheckedOut.into()),
            None => {}
        }

        tx.execute(
            "INSERT INTO attendance (employee_id, name, date, time_in, status, created_at)
             VALUES ((SELECT id FROM employees WHERE name = ?1), ?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                date,
                time_in.format(TIME_FORMAT).to_string(),
                STATUS_PRESENT,
                chrono::Local::now().naive_local().format(DATETIME_FORMAT).to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_time_out(&self, name: &str, time_out: NaiveDateTime) -> Result<(), StoreError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE attendance SET time_out = ?1
             WHERE name = ?2 AND date = ?3 AND time_out IS NULL",
            params![
                time_out.format(TIME_FORMAT).to_string(),
                name,
                time_out.format(DATE_FORMAT).to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(TransitionError::NotCheckedIn.into());
        }
        Ok(())
    }

    fn select_records(&self, filter: &RecordQuery) -> Result<Vec<AttendanceDayRecord>, StoreError> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(from) = filter.from {
            conditions.push("date >= ?");
            values.push(from.format(DATE_FORMAT).to_string());
        }
        if let Some(to) = filter.to {
            conditions.push("date <= ?");
            values.push(to.format(DATE_FORMAT).to_string());
        }
        if let Some(name) = &filter.name {
            conditions.push("name = ?");
            values.push(name.clone());
        }

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM attendance");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY date DESC, time_in DESC");

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values), record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

impl Ledger for AttendanceStore {
    fn status(&self, name: &str, date: NaiveDate) -> Result<DayStatus, LedgerError> {
        Ok(self
            .day_record(name, date)?
            .map_or(DayStatus::NotPresent, |r| r.day_status()))
    }

    fn open_record(&self, name: &str, time_in: NaiveDateTime) -> Result<(), LedgerError> {
        self.insert_open(name, time_in)?;
        tracing::debug!(name, %time_in, "attendance record opened");
        Ok(())
    }

    fn close_record(&self, name: &str, time_out: NaiveDateTime) -> Result<(), LedgerError> {
        self.set_time_out(name, time_out)?;
        tracing::debug!(name, %time_out, "attendance record closed");
        Ok(())
    }

    fn query(&self, filter: &RecordQuery) -> Result<Vec<AttendanceDayRecord>, LedgerError> {
        Ok(self.select_records(filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmployeeDetails;
    use presence_core::AttendanceStateMachine;
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
    }

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        day(d).and_hms_opt(h, m, s).unwrap()
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_open_close_status() {
        let store = AttendanceStore::open_in_memory().unwrap();
        assert_eq!(store.status("alice", day(4)).unwrap(), DayStatus::NotPresent);

        store.open_record("alice", at(4, 9, 0, 0)).unwrap();
        assert_eq!(store.status("alice", day(4)).unwrap(), DayStatus::CheckedIn { time_in: hms(9, 0, 0) });

        store.close_record("alice", at(4, 9, 15, 0)).unwrap();
        assert_eq!(
            store.status("alice", day(4)).unwrap(),
            DayStatus::CheckedOut { time_in: hms(9, 0, 0), time_out: hms(9, 15, 0) }
        );
        assert_eq!(store.status("alice", day(5)).unwrap(), DayStatus::NotPresent);
    }

    #[test]
    fn test_invalid_transitions() {
        let store = AttendanceStore::open_in_memory().unwrap();
        let err = store.close_record("alice", at(4, 9, 0, 0)).unwrap_err();
        assert_eq!(err.transition(), Some(TransitionError::NotCheckedIn));

        store.open_record("alice", at(4, 9, 0, 0)).unwrap();
        let err = store.open_record("alice", at(4, 9, 5, 0)).unwrap_err();
        assert_eq!(err.transition(), Some(TransitionError::AlreadyCheckedIn));

        store.close_record("alice", at(4, 17, 0, 0)).unwrap();
        let err = store.open_record("alice", at(4, 18, 0, 0)).unwrap_err();
        assert_eq!(err.transition(), Some(TransitionError::AlreadyCheckedOut));
        let err = store.close_record("alice", at(4, 18, 0, 0)).unwrap_err();
        assert_eq!(err.transition(), Some(TransitionError::NotCheckedIn));

        let records = store.query(&RecordQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time_out, Some(hms(17, 0, 0)));
    }

    #[test]
    fn test_record_links_employee() {
        let store = AttendanceStore::open_in_memory().unwrap();
        let id = store.upsert_employee("alice", &EmployeeDetails::default()).unwrap();
        store.open_record("alice", at(4, 9, 0, 0)).unwrap();

        let linked: Option<i64> = store
            .lock()
            .query_row("SELECT employee_id FROM attendance WHERE name = 'alice'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(linked, Some(id));
    }

    #[test]
    fn test_query_filters() {
        let store = AttendanceStore::open_in_memory().unwrap();
        store.open_record("alice", at(3, 9, 0, 0)).unwrap();
        store.open_record("bob", at(4, 8, 0, 0)).unwrap();
        store.open_record("alice", at(4, 9, 30, 0)).unwrap();
        store.open_record("alice", at(6, 9, 30, 0)).unwrap();

        let ranged = store
            .query(&RecordQuery { from: Some(day(4)), to: Some(day(5)), name: None })
            .unwrap();
        let got: Vec<_> = ranged.iter().map(|r| (r.date, r.name.as_str())).collect();
        assert_eq!(got, vec![(day(4), "alice"), (day(4), "bob")]);

        let alice = store
            .query(&RecordQuery { name: Some("alice".into()), ..Default::default() })
            .unwrap();
        assert_eq!(alice.iter().map(|r| r.date).collect::<Vec<_>>(), vec![day(6), day(4), day(3)]);
    }

    #[test]
    fn test_checked_in_today() {
        let store = AttendanceStore::open_in_memory().unwrap();
        store.open_record("carol", at(4, 9, 30, 0)).unwrap();
        store.open_record("alice", at(4, 8, 0, 0)).unwrap();
        store.open_record("bob", at(4, 8, 10, 0)).unwrap();
        store.close_record("bob", at(4, 11, 0, 0)).unwrap();

        let names: Vec<_> = store.checked_in(day(4)).unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }

    #[test]
    fn test_concurrent_manual_and_automatic_triggers() {
        let store = Arc::new(AttendanceStore::open_in_memory().unwrap());
        let machine = AttendanceStateMachine::new(store.clone());
        machine.on_recognized("alice", at(4, 9, 0, 0)).unwrap();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let machine = machine.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        machine.manual_checkout("alice", at(4, 12, 0, i)).is_ok()
                    } else {
                        machine.on_recognized("alice", at(4, 12, 0, i)).is_ok_and(|o| o.wrote_ledger())
                    }
                })
            })
            .collect();
        let writes = handles.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();

        assert_eq!(writes, 1);
        let records = store.query(&RecordQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].time_out.is_some());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        {
            let store = AttendanceStore::open(&path).unwrap();
            store.open_record("alice", at(4, 9, 0, 0)).unwrap();
        }
        let store = AttendanceStore::open(&path).unwrap();
        assert_eq!(store.status("alice", day(4)).unwrap(), DayStatus::CheckedIn { time_in: hms(9, 0, 0) });
    }
}
