//! Upstream timetable API client
//!
//! This module fetches faculties, courses and weekly schedules from the
//! university's timetable HTTP service and parses them into our data types.

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::{Client, Url};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

use super::{Course, Faculty, ScheduleDay, WeekSchedule};

/// User agent sent with every upstream request
const USER_AGENT: &str = concat!("timetable-cache/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur when talking to the timetable service
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The configured base URL cannot have path segments appended
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The service answered with a non-success status
    #[error("Upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Failed to parse JSON response
    #[error("Failed to parse JSON response: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Schedule payload as returned by the service
#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    week_start: NaiveDate,
    #[serde(default)]
    days: Vec<ScheduleDay>,
}

/// Client for the timetable service
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct TimetableClient {
    client: Client,
    base_url: Url,
}

impl TimetableClient {
    /// Creates a client for `base_url` with a default HTTP client
    pub fn new(base_url: &str) -> Result<Self, UpstreamError> {
        Self::with_client(Client::new(), base_url)
    }

    /// Creates a client for `base_url` whose requests time out after `timeout`
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Self::with_client(client, base_url)
    }

    /// Creates a client with a custom HTTP client
    pub fn with_client(client: Client, base_url: &str) -> Result<Self, UpstreamError> {
        let base_url =
            Url::parse(base_url).map_err(|e| UpstreamError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(UpstreamError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds `<base>/<segments...>`, escaping each segment
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Fetch the list of faculties
    pub async fn fetch_faculties(&self) -> Result<Vec<Faculty>, UpstreamError> {
        let text = self.get_text(self.endpoint(&["faculties"]), &[]).await?;
        parse_faculties(&text)
    }

    /// Fetch the courses of a faculty, ordered by year of study
    pub async fn fetch_courses(&self, faculty: &str) -> Result<Vec<Course>, UpstreamError> {
        let url = self.endpoint(&["faculties", faculty.trim(), "courses"]);
        let text = self.get_text(url, &[]).await?;
        parse_courses(&text)
    }

    /// Fetch one group's timetable for the week starting on `week_start`
    pub async fn fetch_schedule(
        &self,
        faculty: &str,
        group: &str,
        week_start: NaiveDate,
    ) -> Result<WeekSchedule, UpstreamError> {
        let week = week_start.format("%Y-%m-%d").to_string();
        let query = [
            ("faculty", faculty.trim()),
            ("group", group.trim()),
            ("week", week.as_str()),
        ];
        let text = self.get_text(self.endpoint(&["schedule"]), &query).await?;
        parse_schedule(&text, faculty.trim(), group.trim())
    }

    async fn get_text(&self, url: Url, query: &[(&str, &str)]) -> Result<String, UpstreamError> {
        tracing::debug!(url = %url, "requesting upstream");
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, UpstreamError> {
    Ok(serde_json::from_str(text)?)
}

/// Parse the faculties payload
fn parse_faculties(text: &str) -> Result<Vec<Faculty>, UpstreamError> {
    parse_json(text)
}

/// Parse the courses payload, ordering courses by year of study
fn parse_courses(text: &str) -> Result<Vec<Course>, UpstreamError> {
    let mut courses: Vec<Course> = parse_json(text)?;
    courses.sort_by_key(|course| course.number);
    Ok(courses)
}

/// Parse the schedule payload, ordering days by date and lessons by number
fn parse_schedule(text: &str, faculty: &str, group: &str) -> Result<WeekSchedule, UpstreamError> {
    let response: ScheduleResponse = parse_json(text)?;

    let mut days = response.days;
    days.sort_by_key(|day| day.date);
    for day in &mut days {
        day.lessons.sort_by_key(|lesson| lesson.number);
    }

    Ok(WeekSchedule {
        faculty: faculty.to_string(),
        group: group.to_string(),
        week_start: response.week_start,
        days,
    })
}
