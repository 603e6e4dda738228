//! Timetable CLI - look up university timetables through the cache
//!
//! Prints the requested data as JSON together with its freshness and the
//! `Cache-Control` header a web handler would send with it.

use chrono::Local;
use clap::Parser;
use serde::Serialize;

use timetable_cache::cache::{Cached, Freshness};
use timetable_cache::cli::{load_config, Cli, Request};
use timetable_cache::logging;
use timetable_cache::timetable::TimetableService;

/// JSON document printed for lookups
#[derive(Debug, Serialize)]
struct Response<T> {
    freshness: Freshness,
    cache_control: String,
    data: T,
}

impl<T> From<Cached<T>> for Response<T> {
    fn from(cached: Cached<T>) -> Self {
        Self {
            freshness: cached.freshness,
            cache_control: cached.cache_control(),
            data: cached.value,
        }
    }
}

/// Runs a single request against the service
async fn run(
    service: &TimetableService,
    request: Request,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let value = match request {
        Request::Faculties => serde_json::to_value(Response::from(service.faculties().await?))?,
        Request::Courses { faculty } => {
            serde_json::to_value(Response::from(service.courses(&faculty).await?))?
        }
        Request::Schedule {
            faculty,
            group,
            date,
        } => serde_json::to_value(Response::from(
            service.schedule(&faculty, &group, date).await?,
        ))?,
        Request::Purge => serde_json::to_value(service.sweep())?,
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.logging.level, cli.verbose);

    let request = Request::from_command(&cli.command, Local::now().date_naive())?;

    let service = TimetableService::start(&config)?;
    let result = run(&service, request).await;
    service.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
