//! Caching layer between callers and the upstream timetable service
//!
//! [`CoalescingCache`] keeps values in memory with a TTL, collapses concurrent
//! misses for a key into one upstream call, and keeps expired values around for
//! a grace window so they can be served, marked stale, when the upstream fails.
//! A [`PersistedStore`] can back a cache so stale values survive restarts.

mod coalescing;
mod error;
mod store;
pub mod sweeper;

pub use coalescing::{CacheOptions, Cached, CoalescingCache, Freshness};
pub use error::{CacheError, StoreError};
pub use store::{Persisted, PersistedStore};
pub use sweeper::{sweep_once, SweepHandle, SweepReport};
