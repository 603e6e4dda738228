//! Configuration for the timetable cache
//!
//! Loaded from an optional YAML file; every section falls back to defaults.
//! Durations use humantime notation (`30s`, `15m`, `7days`).
//!
//! ```yaml
//! upstream:
//!   base_url: https://timetable.example.edu/api
//!   timeout: 15s
//! cache:
//!   dir: /var/cache/timetable
//!   sweep_interval: 5m
//! schedule:
//!   ttl: 1h
//!   grace: 6h
//! ```

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::{CacheOptions, PersistedStore};

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is empty
    #[error("config file is empty")]
    Empty,

    /// The configuration file is not valid YAML for [`Config`]
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Upstream timetable service settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the timetable API
    pub base_url: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Settings shared by every cache namespace
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the persisted store. Defaults to the XDG cache directory.
    pub dir: Option<PathBuf>,
    /// Whether to back the in-memory caches with the persisted store
    pub persist: bool,
    /// How often expired entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Sweep synchronously before every read, in addition to the timer
    pub sweep_on_read: bool,
    /// Upper bound on one upstream computation
    #[serde(with = "humantime_serde")]
    pub compute_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            persist: true,
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_on_read: false,
            compute_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// TTL and grace window for one cache namespace
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    /// How long a fetched value stays fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long an expired value is kept as a stale fallback.
    /// Defaults to the TTL.
    #[serde(default, with = "humantime_serde")]
    pub grace: Option<Duration>,
}

impl NamespaceConfig {
    fn with_ttl(ttl: Duration) -> Self {
        Self { ttl, grace: None }
    }

    /// The effective grace window
    pub fn grace(&self) -> Duration {
        self.grace.unwrap_or(self.ttl)
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    /// The faculty list rarely changes
    pub faculties: NamespaceConfig,
    /// Courses and groups change once a term
    pub courses: NamespaceConfig,
    /// Weekly timetables
    pub schedule: NamespaceConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            faculties: NamespaceConfig::with_ttl(Duration::from_secs(30 * 24 * 3600)),
            courses: NamespaceConfig::with_ttl(Duration::from_secs(7 * 24 * 3600)),
            schedule: NamespaceConfig::with_ttl(Duration::from_secs(3600)),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or returns defaults if there is none
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let file = fs::File::open(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_reader(file).map_err(|err| match err {
                    ConfigError::Io { source, .. } => ConfigError::Io {
                        path: path.to_path_buf(),
                        source,
                    },
                    other => other,
                })
            }
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::new(),
                source,
            })?;
        if config.trim().is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(serde_yaml::from_str(&config)?)
    }

    /// Root directory for persisted stores, or `None` if persistence is off
    pub fn store_root(&self) -> Option<PathBuf> {
        if !self.cache.persist {
            return None;
        }
        self.cache.dir.clone().or_else(PersistedStore::default_root)
    }

    /// Cache options for a namespace
    pub fn cache_options(&self, namespace: &NamespaceConfig) -> CacheOptions {
        CacheOptions {
            grace: namespace.grace(),
            sweep_on_read: self.cache.sweep_on_read,
            compute_timeout: self.cache.compute_timeout,
        }
    }
}
