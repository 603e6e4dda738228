//! Timetable cache library
//!
//! A coalescing TTL cache with stale fallback, and the timetable service built
//! on it. Exposed as a library for the `timetable` binary and for integration
//! tests.

pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod logging;
pub mod timetable;
