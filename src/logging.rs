//! Log output setup

use std::env;

use tracing_subscriber::EnvFilter;

/// Picks the filter directive from `RUST_LOG`, the `-v` count, or the configured level
fn filter_directive(configured: &str, verbosity: u8) -> String {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return rust_log;
    }

    match verbosity {
        0 => configured.to_string(),
        1 => "info,timetable_cache=debug".to_string(),
        _ => "debug,timetable_cache=trace".to_string(),
    }
}

/// Initializes logging to stderr
///
/// Stdout is reserved for command output. Calling this more than once is
/// harmless; later calls leave the first subscriber in place.
pub fn init(configured: &str, verbosity: u8) {
    let filter = EnvFilter::try_new(filter_directive(configured, verbosity))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}
