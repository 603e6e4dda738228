//! Timetable service: upstream data behind per-domain caches
//!
//! One cache per kind of data (faculties, courses, weekly schedules), each
//! with its own TTL and grace window. Reads go to memory first, then the
//! persisted store, then the upstream service; when the upstream fails, the
//! last known value is served marked stale.

use std::time::Duration;

use chrono::NaiveDate;

use crate::cache::{
    sweep_once, CacheError, Cached, CoalescingCache, PersistedStore, SweepHandle, SweepReport,
};
use crate::config::Config;
use crate::data::keys::{self, FACULTIES_KEY};
use crate::data::{Course, Faculty, TimetableClient, UpstreamError, WeekSchedule};

/// Namespace names, used for logging and as persisted store directories
pub const FACULTIES: &str = "faculties";
pub const COURSES: &str = "courses";
pub const SCHEDULE: &str = "schedule";

#[derive(Debug, Clone, Copy)]
struct Ttls {
    faculties: Duration,
    courses: Duration,
    schedule: Duration,
}

/// Cached access to the upstream timetable service
///
/// Created with [`start`](Self::start), which also starts one background
/// sweeper per cache; [`shutdown`](Self::shutdown) stops them.
#[derive(Debug)]
pub struct TimetableService {
    client: TimetableClient,
    faculties: CoalescingCache<Vec<Faculty>>,
    courses: CoalescingCache<Vec<Course>>,
    schedule: CoalescingCache<WeekSchedule>,
    ttls: Ttls,
    sweepers: Vec<SweepHandle>,
}

impl TimetableService {
    /// Builds the upstream client and caches from `config` and starts the sweepers
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &Config) -> Result<Self, UpstreamError> {
        let client = TimetableClient::with_timeout(&config.upstream.base_url, config.upstream.timeout)?;
        Ok(Self::with_client(config, client))
    }

    /// Like [`start`](Self::start), with a ready-made upstream client
    pub fn with_client(config: &Config, client: TimetableClient) -> Self {
        let store_root = config.store_root();
        let store = |kind: &str| {
            store_root
                .as_ref()
                .map(|root| PersistedStore::new(root, kind))
        };

        let faculties = CoalescingCache::new(
            FACULTIES,
            config.cache_options(&config.faculties),
            store(FACULTIES),
        );
        let courses = CoalescingCache::new(
            COURSES,
            config.cache_options(&config.courses),
            store(COURSES),
        );
        let schedule = CoalescingCache::new(
            SCHEDULE,
            config.cache_options(&config.schedule),
            store(SCHEDULE),
        );

        let sweepers = vec![
            SweepHandle::spawn(faculties.clone(), config.cache.sweep_interval),
            SweepHandle::spawn(courses.clone(), config.cache.sweep_interval),
            SweepHandle::spawn(schedule.clone(), config.cache.sweep_interval),
        ];
        tracing::debug!(persisted = store_root.is_some(), "timetable caches started");

        Self {
            client,
            faculties,
            courses,
            schedule,
            ttls: Ttls {
                faculties: config.faculties.ttl,
                courses: config.courses.ttl,
                schedule: config.schedule.ttl,
            },
            sweepers,
        }
    }

    /// All faculties
    pub async fn faculties(&self) -> Result<Cached<Vec<Faculty>>, CacheError> {
        let client = self.client.clone();
        self.faculties
            .get_or_stale(
                FACULTIES_KEY,
                move || async move { client.fetch_faculties().await },
                self.ttls.faculties,
            )
            .await
    }

    /// Courses of `faculty` with their groups
    pub async fn courses(&self, faculty: &str) -> Result<Cached<Vec<Course>>, CacheError> {
        let key = keys::courses_key(faculty);
        let client = self.client.clone();
        let faculty = faculty.to_string();
        self.courses
            .get_or_stale(
                &key,
                move || async move { client.fetch_courses(&faculty).await },
                self.ttls.courses,
            )
            .await
    }

    /// Timetable of `group` for the week containing `date`
    pub async fn schedule(
        &self,
        faculty: &str,
        group: &str,
        date: NaiveDate,
    ) -> Result<Cached<WeekSchedule>, CacheError> {
        let key = keys::schedule_key(faculty, group, date);
        let week_start = keys::week_start(date);
        let client = self.client.clone();
        let (faculty, group) = (faculty.to_string(), group.to_string());
        self.schedule
            .get_or_stale(
                &key,
                move || async move { client.fetch_schedule(&faculty, &group, week_start).await },
                self.ttls.schedule,
            )
            .await
    }

    pub fn faculties_cache(&self) -> &CoalescingCache<Vec<Faculty>> {
        &self.faculties
    }

    pub fn courses_cache(&self) -> &CoalescingCache<Vec<Course>> {
        &self.courses
    }

    pub fn schedule_cache(&self) -> &CoalescingCache<WeekSchedule> {
        &self.schedule
    }

    /// Sweeps every cache once, without waiting for the timers
    pub fn sweep(&self) -> SweepReport {
        [
            sweep_once(&self.faculties),
            sweep_once(&self.courses),
            sweep_once(&self.schedule),
        ]
        .into_iter()
        .fold(SweepReport::default(), |total, report| SweepReport {
            memory: total.memory + report.memory,
            persisted: total.persisted + report.persisted,
        })
    }

    /// Stops the background sweepers
    pub async fn shutdown(self) {
        for sweeper in self.sweepers {
            sweeper.shutdown().await;
        }
        tracing::debug!("timetable caches stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Freshness;
    use crate::data::{Group, ScheduleDay};
    use tempfile::TempDir;

    /// Nothing listens on the discard port, so every upstream call fails fast
    const UNREACHABLE: &str = "http://127.0.0.1:9/api";

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.upstream.base_url = UNREACHABLE.to_string();
        config.upstream.timeout = Duration::from_secs(5);
        config.cache.persist = false;
        config
    }

    fn faculty(id: &str) -> Faculty {
        Faculty {
            id: id.to_string(),
            name: format!("Faculty {}", id),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_faculties_are_served_without_upstream() {
        let config = offline_config();
        let service = TimetableService::start(&config).unwrap();
        let faculties = vec![faculty("fit"), faculty("econ")];
        service
            .faculties_cache()
            .set(FACULTIES_KEY, faculties.clone(), Duration::from_millis(2_592_000_000));

        let cached = service.faculties().await.expect("Fresh value should be served");

        assert_eq!(cached.value, faculties);
        assert_eq!(cached.freshness, Freshness::Fresh);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_courses_fall_back_to_stale_when_upstream_fails() {
        let config = offline_config();
        let service = TimetableService::start(&config).unwrap();
        let courses = vec![Course {
            number: 1,
            groups: vec![Group {
                id: "ivt-21".to_string(),
                name: "IVT-21".to_string(),
            }],
        }];
        service
            .courses_cache()
            .set(&keys::courses_key("fit"), courses.clone(), Duration::ZERO);

        let cached = service.courses("fit").await.expect("Stale value should be served");

        assert!(cached.is_stale());
        assert_eq!(cached.value, courses);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_without_previous_value_reports_upstream_error() {
        let config = offline_config();
        let service = TimetableService::start(&config).unwrap();

        let err = service
            .schedule("fit", "ivt-21", date(2026, 10, 14))
            .await
            .unwrap_err();

        let upstream = err
            .upstream_error()
            .and_then(|e| e.downcast_ref::<UpstreamError>());
        assert!(matches!(upstream, Some(UpstreamError::RequestFailed(_))));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_requests_in_same_week_share_a_slot() {
        let config = offline_config();
        let service = TimetableService::start(&config).unwrap();
        let schedule = WeekSchedule {
            faculty: "fit".to_string(),
            group: "ivt-21".to_string(),
            week_start: date(2026, 10, 12),
            days: vec![ScheduleDay {
                date: date(2026, 10, 12),
                lessons: Vec::new(),
            }],
        };
        service.schedule_cache().set(
            &keys::schedule_key("fit", "ivt-21", date(2026, 10, 12)),
            schedule.clone(),
            Duration::from_secs(3600),
        );

        let cached = service
            .schedule(" fit", "ivt-21 ", date(2026, 10, 16))
            .await
            .expect("Same week should hit the cache");

        assert_eq!(cached.freshness, Freshness::Fresh);
        assert_eq!(cached.value, schedule);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_persisted_values_are_shared_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = offline_config();
        config.cache.persist = true;
        config.cache.dir = Some(temp_dir.path().to_path_buf());

        let first = TimetableService::start(&config).unwrap();
        first
            .faculties_cache()
            .set(FACULTIES_KEY, vec![faculty("fit")], Duration::from_secs(3600));
        first.shutdown().await;

        let second = TimetableService::start(&config).unwrap();
        let cached = second.faculties().await.expect("Persisted value should be served");

        assert_eq!(cached.value, vec![faculty("fit")]);
        assert_eq!(cached.freshness, Freshness::Fresh);
        assert!(temp_dir.path().join(FACULTIES).exists());
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_drops_entries_past_grace() {
        let mut config = offline_config();
        config.schedule.grace = Some(Duration::ZERO);
        let service = TimetableService::start(&config).unwrap();
        let schedule = WeekSchedule {
            faculty: "fit".to_string(),
            group: "ivt-21".to_string(),
            week_start: date(2026, 10, 5),
            days: Vec::new(),
        };
        service
            .schedule_cache()
            .set("schedule:old", schedule, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = service.sweep();

        assert_eq!(report.memory, 1);
        assert!(service.schedule_cache().is_empty());
        service.shutdown().await;
    }
}
