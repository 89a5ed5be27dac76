use chrono::NaiveDateTime;

/// Source of wall-clock time for attendance decisions.
///
/// Attendance is recorded in local time: the calendar date of `now()` decides
/// which day a record belongs to.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}
