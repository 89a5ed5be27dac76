use crate::{parse_text, AttendanceStore, StoreError, DATE_FORMAT};
use chrono::NaiveDate;
use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};

/// Per-person attendance over a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub name: String,
    pub days_present: u32,
    pub first_attendance: NaiveDate,
    pub last_attendance: NaiveDate,
}

/// Rows removed by [`AttendanceStore::purge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCounts {
    pub attendance: usize,
    pub employees: usize,
}

impl AttendanceStore {
    /// Days present per name between `from` and `to` inclusive (either bound optional).
    pub fn summary(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceSummary>, StoreError> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(from) = from {
            conditions.push("date >= ?");
            values.push(from.format(DATE_FORMAT).to_string());
        }
        if let Some(to) = to {
            conditions.push("date <= ?");
            values.push(to.format(DATE_FORMAT).to_string());
        }

        let mut sql = String::from(
            "SELECT name, COUNT(*), MIN(date), MAX(date) FROM attendance",
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" GROUP BY name ORDER BY name");

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(AttendanceSummary {
                    name: row.get(0)?,
                    days_present: row.get(1)?,
                    first_attendance: parse_text(2, row.get(2)?, |s| NaiveDate::parse_from_str(s, DATE_FORMAT))?,
                    last_attendance: parse_text(3, row.get(3)?, |s| NaiveDate::parse_from_str(s, DATE_FORMAT))?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete every attendance and employee row and reset the id counters.
    pub fn purge(&self) -> Result<PurgeCounts, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let attendance = tx.execute("DELETE FROM attendance", [])?;
        let employees = tx.execute("DELETE FROM employees", [])?;
        tx.execute(
            "DELETE FROM sqlite_sequence WHERE name IN ('attendance', 'employees')",
            [],
        )?;
        tx.commit()?;

        tracing::warn!(attendance, employees, "attendance store purged");
        Ok(PurgeCounts { attendance, employees })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmployeeDetails;
    use presence_core::{Ledger, RecordQuery};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
    }

    fn seed(store: &AttendanceStore) {
        for (name, d) in [("alice", 1), ("alice", 2), ("alice", 5), ("bob", 2)] {
            store.open_record(name, day(d).and_hms_opt(9, 0, 0).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_summary_all_time() {
        let store = AttendanceStore::open_in_memory().unwrap();
        seed(&store);
        let summary = store.summary(None, None).unwrap();
        assert_eq!(
            summary,
            vec![
                AttendanceSummary { name: "alice".into(), days_present: 3, first_attendance: day(1), last_attendance: day(5) },
                AttendanceSummary { name: "bob".into(), days_present: 1, first_attendance: day(2), last_attendance: day(2) },
            ]
        );
    }

    #[test]
    fn test_summary_range() {
        let store = AttendanceStore::open_in_memory().unwrap();
        seed(&store);
        let summary = store.summary(Some(day(2)), Some(day(4))).unwrap();
        let counts: Vec<_> = summary.iter().map(|s| (s.name.as_str(), s.days_present)).collect();
        assert_eq!(counts, vec![("alice", 1), ("bob", 1)]);
    }

    #[test]
    fn test_purge() {
        let store = AttendanceStore::open_in_memory().unwrap();
        store.upsert_employee("alice", &EmployeeDetails::default()).unwrap();
        seed(&store);

        let counts = store.purge().unwrap();
        assert_eq!(counts, PurgeCounts { attendance: 4, employees: 1 });
        assert!(store.query(&RecordQuery::default()).unwrap().is_empty());
        assert!(store.employees().unwrap().is_empty());

        // Id counters restart after purge.
        assert_eq!(store.upsert_employee("bob", &EmployeeDetails::default()).unwrap(), 1);
    }
}
