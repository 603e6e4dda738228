//! Canonical cache keys
//!
//! Requests that mean the same thing must map to the same key, otherwise they
//! never share a cache slot or an in-flight fetch. Dates are folded to the
//! Monday of their week and identifiers are trimmed.

use chrono::{Datelike, Duration, NaiveDate};

/// Key for the list of faculties
pub const FACULTIES_KEY: &str = "faculties";

/// Returns the Monday of the week containing `date`
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Key for the courses of a faculty
pub fn courses_key(faculty: &str) -> String {
    format!("courses:{}", faculty.trim())
}

/// Key for one group's timetable in the week containing `date`
pub fn schedule_key(faculty: &str, group: &str, date: NaiveDate) -> String {
    format!(
        "schedule:{}|{}|{}",
        faculty.trim(),
        group.trim(),
        week_start(date).format("%Y-%m-%d")
    )
}
