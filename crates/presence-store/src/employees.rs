use crate::{parse_text, AttendanceStore, StoreError, DATETIME_FORMAT};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Optional contact details recorded at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeDetails {
    pub email: String,
    pub phone: String,
    pub department: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub details: EmployeeDetails,
    pub created_at: NaiveDateTime,
}

fn employee_from_row(row: &Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        id: row.get(0)?,
        name: row.get(1)?,
        details: EmployeeDetails {
            email: row.get(2)?,
            phone: row.get(3)?,
            department: row.get(4)?,
        },
        created_at: parse_text(5, row.get(5)?, |s| NaiveDateTime::parse_from_str(s, DATETIME_FORMAT))?,
    })
}

impl AttendanceStore {
    /// Insert `name` or update its details; returns the employee id.
    pub fn upsert_employee(&self, name: &str, details: &EmployeeDetails) -> Result<i64, StoreError> {
        let conn = self.lock();
        let id = conn.query_row(
            "INSERT INTO employees (name, email, phone, department, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 email = excluded.email,
                 phone = excluded.phone,
                 department = excluded.department
             RETURNING id",
            params![
                name,
                details.email,
                details.phone,
                details.department,
                chrono::Local::now().naive_local().format(DATETIME_FORMAT).to_string(),
            ],
            |row| row.get(0),
        )?;
        tracing::debug!(name, id, "employee upserted");
        Ok(id)
    }

    pub fn employee(&self, name: &str) -> Result<Option<Employee>, StoreError> {
        let conn = self.lock();
        let employee = conn
            .query_row(
                "SELECT id, name, email, phone, department, created_at FROM employees WHERE name = ?1",
                params![name],
                employee_from_row,
            )
            .optional()?;
        Ok(employee)
    }

    /// All employees ordered by name.
    pub fn employees(&self) -> Result<Vec<Employee>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, email, phone, department, created_at FROM employees ORDER BY name")?;
        let employees = stmt
            .query_map([], employee_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(employees)
    }

    /// Delete the directory entry. Attendance history is kept.
    pub fn remove_employee(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let removed = conn.execute("DELETE FROM employees WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{Ledger, RecordQuery};

    fn details(department: &str) -> EmployeeDetails {
        EmployeeDetails {
            email: "a@example.com".into(),
            phone: "555-0100".into(),
            department: department.into(),
        }
    }

    #[test]
    fn test_upsert_updates_existing() {
        let store = AttendanceStore::open_in_memory().unwrap();
        let id = store.upsert_employee("alice", &details("R&D")).unwrap();
        let again = store.upsert_employee("alice", &details("Ops")).unwrap();
        assert_eq!(id, again);

        let alice = store.employee("alice").unwrap().unwrap();
        assert_eq!(alice.details.department, "Ops");
        assert_eq!(store.employees().unwrap().len(), 1);
    }

    #[test]
    fn test_employees_sorted() {
        let store = AttendanceStore::open_in_memory().unwrap();
        store.upsert_employee("carol", &EmployeeDetails::default()).unwrap();
        store.upsert_employee("alice", &EmployeeDetails::default()).unwrap();
        let names: Vec<_> = store.employees().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }

    #[test]
    fn test_remove_keeps_history() {
        let store = AttendanceStore::open_in_memory().unwrap();
        store.upsert_employee("alice", &EmployeeDetails::default()).unwrap();
        store
            .open_record("alice", chrono::NaiveDate::from_ymd_opt(2025, 8, 4).unwrap().and_hms_opt(9, 0, 0).unwrap())
            .unwrap();

        assert!(store.remove_employee("alice").unwrap());
        assert!(!store.remove_employee("alice").unwrap());
        assert!(store.employee("alice").unwrap().is_none());
        assert_eq!(store.query(&RecordQuery::default()).unwrap().len(), 1);
    }
}
