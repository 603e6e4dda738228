//! Core data models for the timetable service
//!
//! This module contains the types returned by the upstream timetable service:
//! faculties, courses with their student groups, and weekly schedules.

pub mod client;
pub mod keys;

pub use client::{TimetableClient, UpstreamError};

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// A faculty of the university
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faculty {
    /// Identifier used in upstream requests
    pub id: String,
    /// Human-readable name
    pub name: String,
}

/// A student group within a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Identifier used in upstream requests
    pub id: String,
    /// Human-readable name
    pub name: String,
}

/// A year of study within a faculty and the groups enrolled in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    /// Year of study, starting at 1
    pub number: u8,
    /// Groups in this course
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// Kinds of classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonKind {
    Lecture,
    Practice,
    Lab,
    Seminar,
    Exam,
    #[serde(other)]
    Other,
}

/// A single class in the timetable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    /// Position of the class within the day, starting at 1
    pub number: u8,
    /// Start time, local to the university
    #[serde(with = "hhmm")]
    pub starts_at: NaiveTime,
    /// End time, local to the university
    #[serde(with = "hhmm")]
    pub ends_at: NaiveTime,
    /// Subject name
    pub subject: String,
    /// Kind of class
    pub kind: LessonKind,
    /// Teacher, if announced
    #[serde(default)]
    pub teacher: Option<String>,
    /// Room, if assigned
    #[serde(default)]
    pub room: Option<String>,
}

/// Classes on one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDay {
    pub date: NaiveDate,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
}

/// The timetable of one group for one week
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekSchedule {
    /// Faculty the group belongs to
    pub faculty: String,
    /// The group this timetable is for
    pub group: String,
    /// Monday of the week
    pub week_start: NaiveDate,
    /// Days with classes, in date order
    pub days: Vec<ScheduleDay>,
}

impl WeekSchedule {
    /// Total number of classes in the week
    pub fn lesson_count(&self) -> usize {
        self.days.iter().map(|day| day.lessons.len()).sum()
    }
}

/// `HH:MM` times as used by the upstream service
mod hhmm {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(|_| D::Error::custom(format!("invalid time `{}`, expected HH:MM", s)))
    }
}
