//! Command-line interface parsing for the timetable tool
//!
//! This module handles parsing of CLI arguments using clap, applying the global
//! flags on top of the configuration file, and turning the chosen subcommand
//! into a [`Request`] with validated arguments.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;

use crate::config::{Config, ConfigError};

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// The date argument is not a valid calendar date
    #[error("Invalid date: '{0}'. Expected YYYY-MM-DD")]
    InvalidDate(String),

    /// An identifier argument is blank
    #[error("Invalid {0}: must not be empty")]
    EmptyArgument(&'static str),

    /// The configuration file could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// University timetable lookups through a coalescing, stale-tolerant cache
#[derive(Parser, Debug)]
#[command(name = "timetable")]
#[command(about = "University timetable lookups through a coalescing cache")]
#[command(version)]
pub struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, short = 'c', value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the upstream timetable API
    #[arg(long, value_name = "URL", global = true)]
    pub base_url: Option<String>,

    /// Directory for the persisted fallback store
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Keep cached values in memory only
    #[arg(long, global = true)]
    pub no_persist: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List all faculties
    Faculties,
    /// List the courses and groups of a faculty
    Courses {
        /// Faculty identifier
        faculty: String,
    },
    /// Show a group's timetable for one week
    ///
    /// Examples:
    ///   timetable schedule fit ivt-21                    # this week
    ///   timetable schedule fit ivt-21 --date 2026-10-21  # week containing that date
    Schedule {
        /// Faculty identifier
        faculty: String,
        /// Group identifier
        group: String,
        /// Any date in the wanted week (defaults to today)
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<String>,
    },
    /// Remove expired entries from the caches and the persisted store
    Purge,
}

/// A validated request derived from the subcommand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Faculties,
    Courses {
        faculty: String,
    },
    Schedule {
        faculty: String,
        group: String,
        date: NaiveDate,
    },
    Purge,
}

/// Parses a date argument
///
/// # Returns
/// * `Ok(NaiveDate)` for a valid `YYYY-MM-DD` date
/// * `Err(CliError::InvalidDate)` otherwise
pub fn parse_date_arg(s: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| CliError::InvalidDate(s.to_string()))
}

fn non_empty(value: &str, what: &'static str) -> Result<String, CliError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CliError::EmptyArgument(what));
    }
    Ok(value.to_string())
}

impl Request {
    /// Creates a Request from the parsed subcommand
    ///
    /// `today` is used when `schedule` is given no `--date`.
    pub fn from_command(command: &Command, today: NaiveDate) -> Result<Self, CliError> {
        match command {
            Command::Faculties => Ok(Request::Faculties),
            Command::Courses { faculty } => Ok(Request::Courses {
                faculty: non_empty(faculty, "faculty")?,
            }),
            Command::Schedule {
                faculty,
                group,
                date,
            } => {
                let date = match date {
                    Some(date) => parse_date_arg(date)?,
                    None => today,
                };
                Ok(Request::Schedule {
                    faculty: non_empty(faculty, "faculty")?,
                    group: non_empty(group, "group")?,
                    date,
                })
            }
            Command::Purge => Ok(Request::Purge),
        }
    }
}

/// Loads the configuration file named on the command line and applies the flag overrides
pub fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::get(cli.config.as_deref())?;

    if let Some(base_url) = &cli.base_url {
        config.upstream.base_url = base_url.clone();
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache.dir = Some(cache_dir.clone());
    }
    if cli.no_persist {
        config.cache.persist = false;
    }

    Ok(config)
}
