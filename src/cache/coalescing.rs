//! In-memory TTL cache with request coalescing and stale fallback
//!
//! Concurrent misses for the same key share a single computation. Values that
//! have expired stay in memory for a grace window so they can still be served
//! when the upstream source fails.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CacheError, PersistedStore};

type ComputationResult<V> = Result<Cached<V>, CacheError>;
type ComputationChannel<V> = Shared<oneshot::Receiver<ComputationResult<V>>>;

/// Upper bound for expiry times, used when `now + ttl` overflows
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// How a returned value relates to its TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Served from the cache before its expiry
    Fresh,
    /// Produced by a computation this call started or joined
    Computed,
    /// Past its expiry; only served as a fallback
    Stale,
}

/// A cached value together with its freshness
#[derive(Debug, Clone)]
pub struct Cached<V> {
    /// The cached value
    pub value: V,
    /// Whether the value is fresh, just computed, or stale
    pub freshness: Freshness,
    /// When the value stops (or stopped) being fresh
    pub expires_at: Instant,
}

impl<V> Cached<V> {
    /// Whether this value is past its TTL
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    /// Time left until the value expires, zero if it already has
    pub fn expires_in(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Suggested `Cache-Control` header for a response carrying this value
    pub fn cache_control(&self) -> String {
        match self.freshness {
            Freshness::Stale => "no-cache".to_string(),
            Freshness::Fresh | Freshness::Computed => {
                format!("public, max-age={}", self.expires_in().as_secs())
            }
        }
    }

    /// Maps the value, keeping freshness and expiry
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            freshness: self.freshness,
            expires_at: self.expires_at,
        }
    }
}

/// Tuning knobs for a single cache instance
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// How long an expired entry is kept around as a stale fallback
    pub grace: Duration,
    /// Run a sweep before every `get` / `get_with_stale`
    pub sweep_on_read: bool,
    /// Upper bound on a single computation, `None` for no limit
    pub compute_timeout: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3600),
            sweep_on_read: false,
            compute_timeout: Some(Duration::from_secs(30)),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    /// Wall-clock expiry of the store document backing this entry
    persisted: Option<DateTime<Utc>>,
}

impl<V: Clone> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn to_cached(&self, now: Instant) -> Cached<V> {
        Cached {
            value: self.value.clone(),
            freshness: if self.is_fresh(now) {
                Freshness::Fresh
            } else {
                Freshness::Stale
            },
            expires_at: self.expires_at,
        }
    }
}

struct InFlight<V> {
    generation: u64,
    channel: ComputationChannel<V>,
}

struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    next_generation: u64,
}

impl<V> State<V> {
    /// Removes the in-flight slot for `key` if it is still the one registered as `generation`
    fn release(&mut self, key: &str, generation: u64) {
        if self
            .in_flight
            .get(key)
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            self.in_flight.remove(key);
        }
    }
}

struct Inner<V> {
    name: String,
    options: CacheOptions,
    store: Option<PersistedStore>,
    state: Mutex<State<V>>,
}

/// Clears an in-flight slot when the computation ends, however it ends
struct InFlightGuard<V> {
    inner: Arc<Inner<V>>,
    key: String,
    generation: u64,
    armed: bool,
}

impl<V> InFlightGuard<V> {
    fn release(&mut self, state: &mut State<V>) {
        if self.armed {
            state.release(&self.key, self.generation);
            self.armed = false;
        }
    }
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().release(&self.key, self.generation);
        }
    }
}

enum Lookup<V> {
    Ready(Cached<V>),
    Waiting(ComputationChannel<V>),
}

/// TTL cache that coalesces concurrent computations per key
///
/// Cloning is cheap and yields a handle to the same cache. All bookkeeping
/// happens under one short-lived lock that is never held across an `.await`
/// or across file I/O. Computations run as spawned Tokio tasks, so they finish
/// and populate the cache even if every waiting caller goes away.
pub struct CoalescingCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CoalescingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for CoalescingCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CoalescingCache")
            .field("name", &self.inner.name)
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .field("store", &self.inner.store)
            .finish()
    }
}

impl<V> CoalescingCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Creates an empty cache, optionally backed by a persisted store
    pub fn new(name: impl Into<String>, options: CacheOptions, store: Option<PersistedStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                store,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_generation: 0,
                }),
            }),
        }
    }

    /// The name used in log output
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    pub fn store(&self) -> Option<&PersistedStore> {
        self.inner.store.as_ref()
    }

    /// Number of entries held in memory, fresh or stale
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value for `key` if it is present and fresh
    ///
    /// Never starts a computation.
    pub fn get(&self, key: &str) -> Option<V> {
        self.sweep_before_read();
        self.lookup(key)
            .filter(|cached| !cached.is_stale())
            .map(|cached| cached.value)
    }

    /// Returns the value for `key` regardless of its age
    ///
    /// Never starts a computation. Use [`Cached::is_stale`] to tell an expired
    /// value from a fresh one.
    pub fn get_with_stale(&self, key: &str) -> Option<Cached<V>> {
        self.sweep_before_read();
        self.lookup(key)
    }

    /// Installs a fresh value for `key`, replacing whatever was there
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let persisted = self.persist(key, &value, ttl);
        let expires_at = expiry(Instant::now(), ttl);
        self.inner.state.lock().entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at,
                persisted,
            },
        );
    }

    /// Returns the fresh value for `key`, computing it if needed
    ///
    /// Concurrent callers for the same key share one invocation of `compute`
    /// and all receive its outcome. A failed computation leaves any previous
    /// value untouched and the next call starts a new computation.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.fetch(key, compute, ttl).await.map(|cached| cached.value)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but reports freshness
    ///
    /// A hit comes back as [`Freshness::Fresh`]; a value produced by a
    /// computation started or joined by this call as [`Freshness::Computed`].
    pub async fn fetch<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
    ) -> Result<Cached<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        if let Some(cached) = self.lookup(key) {
            if !cached.is_stale() {
                debug!(cache = %self.inner.name, key, "cache hit");
                return Ok(cached);
            }
        }

        let channel = match self.join_or_spawn(key, compute, ttl) {
            Lookup::Ready(cached) => return Ok(cached),
            Lookup::Waiting(channel) => channel,
        };

        match channel.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(CacheError::Cancelled(key.to_string())),
        }
    }

    /// Fetches `key`, falling back to a stale value if the computation fails
    ///
    /// The error is returned only when there is no previous value to fall
    /// back to.
    pub async fn get_or_stale<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
    ) -> Result<Cached<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        match self.fetch(key, compute, ttl).await {
            Ok(cached) => Ok(cached),
            Err(err) => match self.lookup(key) {
                Some(cached) => {
                    warn!(
                        cache = %self.inner.name,
                        key,
                        error = %err,
                        "upstream failed, serving stale value"
                    );
                    Ok(cached)
                }
                None => Err(err),
            },
        }
    }

    /// Drops entries that expired more than `grace` ago
    ///
    /// Entries inside the grace window are kept as stale fallbacks. The store
    /// documents backing removed entries are deleted too. Returns the number
    /// of entries removed from memory.
    pub fn cleanup_expired(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut documents = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.entries.retain(|key, entry| {
                if now.saturating_duration_since(entry.expires_at) <= grace {
                    return true;
                }
                removed += 1;
                if let Some(expires_at) = entry.persisted {
                    documents.push((key.clone(), expires_at));
                }
                false
            });
        }

        if let Some(store) = &self.inner.store {
            for (key, expires_at) in documents {
                if let Err(err) = store.remove_if_expires_at(&key, expires_at) {
                    warn!(cache = %self.inner.name, key = %key, error = %err, "failed to remove swept document");
                }
            }
        }

        if removed > 0 {
            debug!(cache = %self.inner.name, removed, "swept expired entries");
        }
        removed
    }

    fn sweep_before_read(&self) {
        if self.inner.options.sweep_on_read {
            self.cleanup_expired(self.inner.options.grace);
        }
    }

    /// Memory first, persisted store second
    fn lookup(&self, key: &str) -> Option<Cached<V>> {
        let now = Instant::now();
        let hit = {
            let state = self.inner.state.lock();
            state.entries.get(key).map(|entry| entry.to_cached(now))
        };
        hit.or_else(|| self.hydrate(key, now))
    }

    /// Loads `key` from the persisted store into memory
    fn hydrate(&self, key: &str, now: Instant) -> Option<Cached<V>> {
        let store = self.inner.store.as_ref()?;
        let persisted = match store.read::<V>(key) {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return None,
            Err(err) => {
                warn!(cache = %self.inner.name, key, error = %err, "failed to read persisted entry");
                return None;
            }
        };

        let grace = ChronoDuration::from_std(self.inner.options.grace).unwrap_or(ChronoDuration::MAX);
        if Utc::now().signed_duration_since(persisted.expires_at) > grace {
            debug!(cache = %self.inner.name, key, "persisted entry is past its grace window");
            if let Err(err) = store.remove_if_expires_at(key, persisted.expires_at) {
                warn!(cache = %self.inner.name, key, error = %err, "failed to remove expired document");
            }
            return None;
        }

        let Some(expires_at) = instant_from_wall_clock(persisted.expires_at, now) else {
            // too old for the monotonic clock, serve it without caching it in memory
            return Some(Cached {
                value: persisted.value,
                freshness: Freshness::Stale,
                expires_at: now,
            });
        };

        let mut state = self.inner.state.lock();
        // a computation may have installed a newer value while we were reading
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert(CacheEntry {
                value: persisted.value,
                expires_at,
                persisted: Some(persisted.expires_at),
            });
        debug!(cache = %self.inner.name, key, "loaded entry from persisted store");
        Some(entry.to_cached(now))
    }

    fn join_or_spawn<F, Fut, E>(&self, key: &str, compute: F, ttl: Duration) -> Lookup<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let (generation, sender, channel) = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();

            // another computation may have finished since the caller looked
            if let Some(entry) = state.entries.get(key) {
                if entry.is_fresh(now) {
                    return Lookup::Ready(entry.to_cached(now));
                }
            }

            if let Some(in_flight) = state.in_flight.get(key) {
                debug!(cache = %self.inner.name, key, "joining in-flight computation");
                return Lookup::Waiting(in_flight.channel.clone());
            }

            let generation = state.next_generation;
            state.next_generation += 1;

            let (sender, receiver) = oneshot::channel();
            let channel = receiver.shared();
            state.in_flight.insert(
                key.to_string(),
                InFlight {
                    generation,
                    channel: channel.clone(),
                },
            );
            (generation, sender, channel)
        };

        debug!(cache = %self.inner.name, key, "starting computation");
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            generation,
            armed: true,
        };
        let computation = compute();
        tokio::spawn(self.clone().run_computation(guard, computation, ttl, sender));

        Lookup::Waiting(channel)
    }

    async fn run_computation<Fut, E>(
        self,
        mut guard: InFlightGuard<V>,
        computation: Fut,
        ttl: Duration,
        sender: oneshot::Sender<ComputationResult<V>>,
    ) where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let key = guard.key.clone();
        let result = match self.inner.options.compute_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, computation).await {
                Ok(result) => result.map_err(CacheError::upstream),
                Err(_) => Err(CacheError::Timeout {
                    key: key.clone(),
                    timeout,
                }),
            },
            None => computation.await.map_err(CacheError::upstream),
        };

        let persisted = match &result {
            Ok(value) => self.persist(&key, value, ttl),
            Err(err) => {
                debug!(cache = %self.inner.name, key = %key, error = %err, "computation failed");
                None
            }
        };

        let result = {
            let mut state = self.inner.state.lock();
            let result = result.map(|value| {
                let expires_at = expiry(Instant::now(), ttl);
                state.entries.insert(
                    key.clone(),
                    CacheEntry {
                        value: value.clone(),
                        expires_at,
                        persisted,
                    },
                );
                Cached {
                    value,
                    freshness: Freshness::Computed,
                    expires_at,
                }
            });
            guard.release(&mut state);
            result
        };

        // every waiter may have gone away already
        sender.send(result).ok();
    }

    /// Best-effort write to the persisted store
    ///
    /// Returns the wall-clock expiry of the written document.
    fn persist(&self, key: &str, value: &V, ttl: Duration) -> Option<DateTime<Utc>> {
        let store = self.inner.store.as_ref()?;

        let expires_at = wall_clock_expiry(Utc::now(), ttl);
        match store.write(key, value, expires_at) {
            Ok(()) => Some(expires_at),
            Err(err) => {
                warn!(cache = %self.inner.name, key, error = %err, "failed to persist entry");
                None
            }
        }
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

fn wall_clock_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(ttl.min(MAX_TTL))
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(now)
}

/// Converts a persisted wall-clock expiry into a monotonic instant
///
/// Returns `None` when the expiry lies further back than the monotonic clock
/// can represent.
fn instant_from_wall_clock(expires_at: DateTime<Utc>, now: Instant) -> Option<Instant> {
    let wall_now = Utc::now();
    match (expires_at - wall_now).to_std() {
        Ok(remaining) => Some(expiry(now, remaining)),
        Err(_) => {
            let overdue = (wall_now - expires_at).to_std().unwrap_or_default();
            now.checked_sub(overdue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use thiserror::Error;
    use tokio::time::{advance, sleep};

    const TTL: Duration = Duration::from_secs(60);

    #[derive(Debug, Error)]
    #[error("upstream unavailable")]
    struct TestError;

    fn test_cache() -> CoalescingCache<Vec<String>> {
        CoalescingCache::new("test", CacheOptions::default(), None)
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn failing_fetch() -> Result<Vec<String>, TestError> {
        Err(TestError)
    }

    async fn panicking_fetch() -> Result<Vec<String>, TestError> {
        panic!("upstream client panicked")
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_computation() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                Ok::<_, TestError>(list(&["math", "physics"]))
            }
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_compute("courses:fit", fetch(), TTL),
            cache.get_or_compute("courses:fit", fetch(), TTL),
            cache.get_or_compute("courses:fit", fetch(), TTL),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), list(&["math", "physics"]));
        assert_eq!(b.unwrap(), list(&["math", "physics"]));
        assert_eq!(c.unwrap(), list(&["math", "physics"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_does_not_compute() {
        let cache = test_cache();
        cache.set("faculties", list(&["fit"]), TTL);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cached = cache
            .fetch(
                "faculties",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(list(&["other"]))
                },
                TTL,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cached.value, list(&["fit"]));
        assert_eq!(cached.freshness, Freshness::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_expires_exactly_at_ttl() {
        let cache = test_cache();
        cache.set("faculties", list(&["fit"]), Duration::from_secs(10));

        advance(Duration::from_millis(9_999)).await;
        assert_eq!(cache.get("faculties"), Some(list(&["fit"])));

        advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("faculties"), None);

        let stale = cache.get_with_stale("faculties").expect("stale value should remain");
        assert!(stale.is_stale());
        assert_eq!(stale.value, list(&["fit"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_stale_value() {
        let cache = test_cache();
        cache
            .get_or_compute("courses:fit", || async { Ok::<_, TestError>(list(&["math"])) }, TTL)
            .await
            .unwrap();
        advance(TTL + Duration::from_secs(1)).await;

        let err = cache
            .get_or_compute("courses:fit", failing_fetch, TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Upstream(_)));

        let stale = cache.get_with_stale("courses:fit").unwrap();
        assert!(stale.is_stale());
        assert_eq!(stale.value, list(&["math"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_stale_falls_back_after_failure() {
        let cache = test_cache();
        cache.set("courses:fit", list(&["math"]), TTL);
        advance(TTL).await;

        let cached = cache
            .get_or_stale("courses:fit", failing_fetch, TTL)
            .await
            .unwrap();

        assert!(cached.is_stale());
        assert_eq!(cached.value, list(&["math"]));
        assert_eq!(cached.cache_control(), "no-cache");
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_stale_without_previous_value_fails() {
        let cache = test_cache();

        let result = cache.get_or_stale("courses:fit", failing_fetch, TTL).await;

        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_refreshes_to_fresh() {
        let cache = test_cache();
        cache.set("courses:fit", list(&["math"]), TTL);
        advance(TTL).await;

        let cached = cache
            .fetch("courses:fit", || async { Ok::<_, TestError>(list(&["math", "art"])) }, TTL)
            .await
            .unwrap();

        assert_eq!(cached.freshness, Freshness::Computed);
        assert_eq!(cache.get("courses:fit"), Some(list(&["math", "art"])));
        assert!(cached.cache_control().starts_with("public, max-age="));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_retry_is_possible() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                Err::<Vec<String>, _>(TestError)
            }
        };

        let (a, b) = tokio::join!(
            cache.get_or_compute("k", fetch(), TTL),
            cache.get_or_compute("k", fetch(), TTL),
        );
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = cache
            .get_or_compute("k", || async { Ok::<_, TestError>(list(&["ok"])) }, TTL)
            .await
            .unwrap();
        assert_eq!(value, list(&["ok"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_keys_do_not_block() {
        let cache = test_cache();
        let slow = cache.get_or_compute(
            "a",
            || async {
                sleep(Duration::from_secs(3600)).await;
                Ok::<_, TestError>(list(&["slow"]))
            },
            TTL,
        );
        tokio::pin!(slow);
        assert!(futures::poll!(&mut slow).is_pending());

        let fast = cache
            .get_or_compute("b", || async { Ok::<_, TestError>(list(&["fast"])) }, TTL)
            .await
            .unwrap();

        assert_eq!(fast, list(&["fast"]));
        assert_eq!(cache.get("a"), None);
        assert!(futures::poll!(&mut slow).is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_computation_does_not_wedge_key() {
        let cache = test_cache();

        let err = cache
            .get_or_compute("k", panicking_fetch, TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled(_)));

        let value = cache
            .get_or_compute("k", || async { Ok::<_, TestError>(list(&["recovered"])) }, TTL)
            .await
            .unwrap();
        assert_eq!(value, list(&["recovered"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_all_waiters_and_clears_slot() {
        let options = CacheOptions {
            compute_timeout: Some(Duration::from_secs(1)),
            ..CacheOptions::default()
        };
        let cache: CoalescingCache<Vec<String>> = CoalescingCache::new("test", options, None);
        let slow = || {
            || async {
                sleep(Duration::from_secs(10)).await;
                Ok::<_, TestError>(list(&["late"]))
            }
        };

        let (a, b) = tokio::join!(
            cache.get_or_compute("k", slow(), TTL),
            cache.get_or_compute("k", slow(), TTL),
        );
        assert!(matches!(a, Err(CacheError::Timeout { .. })));
        assert!(matches!(b, Err(CacheError::Timeout { .. })));

        let value = cache
            .get_or_compute("k", || async { Ok::<_, TestError>(list(&["quick"])) }, TTL)
            .await
            .unwrap();
        assert_eq!(value, list(&["quick"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_cancel_computation() {
        let cache = test_cache();
        {
            let pending = cache.get_or_compute(
                "k",
                || async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, TestError>(list(&["done"]))
                },
                TTL,
            );
            tokio::pin!(pending);
            assert!(futures::poll!(&mut pending).is_pending());
        }

        sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.get("k"), Some(list(&["done"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_respects_grace_boundary() {
        let cache = test_cache();
        let grace = Duration::from_secs(10);

        cache.set("old", list(&["old"]), Duration::ZERO);
        advance(Duration::from_millis(2)).await;
        cache.set("new", list(&["new"]), Duration::ZERO);
        advance(grace - Duration::from_millis(1)).await;

        // "old" expired grace + 1ms ago, "new" grace - 1ms ago
        assert_eq!(cache.cleanup_expired(grace), 1);
        assert!(cache.get_with_stale("old").is_none());
        assert!(cache.get_with_stale("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_on_read() {
        let options = CacheOptions {
            grace: Duration::ZERO,
            sweep_on_read: true,
            ..CacheOptions::default()
        };
        let cache: CoalescingCache<Vec<String>> = CoalescingCache::new("test", options, None);
        cache.set("k", list(&["v"]), Duration::from_secs(1));

        advance(Duration::from_secs(2)).await;

        assert!(cache.get_with_stale("k").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_values_survive_restart_through_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = PersistedStore::new(temp_dir.path(), "faculties");

        let first: CoalescingCache<Vec<String>> =
            CoalescingCache::new("faculties", CacheOptions::default(), Some(store.clone()));
        first
            .get_or_compute("faculties", || async { Ok::<_, TestError>(list(&["fit"])) }, TTL)
            .await
            .unwrap();
        drop(first);

        let second: CoalescingCache<Vec<String>> =
            CoalescingCache::new("faculties", CacheOptions::default(), Some(store));
        assert_eq!(second.get("faculties"), Some(list(&["fit"])));
    }

    #[tokio::test]
    async fn test_expired_persisted_value_is_served_stale() {
        let temp_dir = TempDir::new().unwrap();
        let store = PersistedStore::new(temp_dir.path(), "courses");
        store
            .write("courses:fit", &list(&["math"]), Utc::now() - ChronoDuration::minutes(30))
            .unwrap();

        let cache: CoalescingCache<Vec<String>> =
            CoalescingCache::new("courses", CacheOptions::default(), Some(store));

        assert_eq!(cache.get("courses:fit"), None);
        let cached = cache
            .get_or_stale("courses:fit", failing_fetch, TTL)
            .await
            .unwrap();
        assert!(cached.is_stale());
        assert_eq!(cached.value, list(&["math"]));
    }

    fn store_backed(grace: Duration, sweep_on_read: bool) -> (CoalescingCache<Vec<String>>, PersistedStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = PersistedStore::new(temp_dir.path(), "courses");
        let options = CacheOptions {
            grace,
            sweep_on_read,
            ..CacheOptions::default()
        };
        let cache = CoalescingCache::new("courses", options, Some(store.clone()));
        (cache, store, temp_dir)
    }

    #[tokio::test]
    async fn test_persisted_value_past_grace_is_a_miss() {
        for sweep_on_read in [false, true] {
            let grace = Duration::from_secs(10);
            let (cache, store, _temp_dir) = store_backed(grace, sweep_on_read);
            store
                .write("courses:fit", &list(&["old"]), Utc::now() - ChronoDuration::hours(1))
                .unwrap();

            assert!(cache.get_with_stale("courses:fit").is_none());
            assert_eq!(cache.cleanup_expired(grace), 0);
            assert!(cache.get_with_stale("courses:fit").is_none());
            assert!(store.read::<Vec<String>>("courses:fit").unwrap().is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_swept_entry_does_not_come_back_from_store() {
        let grace = Duration::from_secs(10);
        let (cache, store, _temp_dir) = store_backed(grace, false);
        cache.set("courses:fit", list(&["old"]), Duration::from_secs(1));

        advance(grace + Duration::from_secs(2)).await;

        assert_eq!(cache.cleanup_expired(grace), 1);
        assert!(cache.get_with_stale("courses:fit").is_none());
        assert!(store.read::<Vec<String>>("courses:fit").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_on_read_also_clears_store() {
        let grace = Duration::from_secs(10);
        let (cache, store, _temp_dir) = store_backed(grace, true);
        cache.set("courses:fit", list(&["old"]), Duration::from_secs(1));

        advance(grace + Duration::from_secs(2)).await;

        assert!(cache.get_with_stale("courses:fit").is_none());
        assert!(cache.is_empty());
        assert!(store.read::<Vec<String>>("courses:fit").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrated_entry_keeps_its_age() {
        let grace = Duration::from_secs(3600);
        let (cache, store, _temp_dir) = store_backed(grace, false);
        store
            .write("courses:fit", &list(&["math"]), Utc::now() - ChronoDuration::minutes(30))
            .unwrap();

        assert!(cache.get_with_stale("courses:fit").unwrap().is_stale());
        advance(Duration::from_secs(29 * 60)).await;
        assert_eq!(cache.cleanup_expired(grace), 0);

        advance(Duration::from_secs(2 * 60)).await;
        assert_eq!(cache.cleanup_expired(grace), 1);
        assert!(cache.get_with_stale("courses:fit").is_none());
    }

    #[test]
    fn test_instant_from_wall_clock_keeps_overdue_time() {
        let now = Instant::now();
        let past = instant_from_wall_clock(Utc::now() - ChronoDuration::minutes(10), now)
            .expect("ten minutes back is representable");
        assert!(now.duration_since(past) >= Duration::from_secs(599));

        let future = instant_from_wall_clock(Utc::now() + ChronoDuration::minutes(10), now).unwrap();
        assert!(future > now);
    }

    #[tokio::test]
    async fn test_store_write_failure_does_not_fail_caller() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-directory");
        std::fs::write(&blocker, "occupied").unwrap();
        let store = PersistedStore::new(&blocker, "courses");

        let cache: CoalescingCache<Vec<String>> =
            CoalescingCache::new("courses", CacheOptions::default(), Some(store));
        let value = cache
            .get_or_compute("courses:fit", || async { Ok::<_, TestError>(list(&["math"])) }, TTL)
            .await
            .unwrap();

        assert_eq!(value, list(&["math"]));
        assert_eq!(cache.get("courses:fit"), Some(list(&["math"])));
    }

    #[tokio::test]
    async fn test_set_writes_through_to_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = PersistedStore::new(temp_dir.path(), "faculties");
        let cache: CoalescingCache<Vec<String>> =
            CoalescingCache::new("faculties", CacheOptions::default(), Some(store.clone()));

        cache.set("faculties", list(&["fit", "econ"]), TTL);

        let persisted = store.read::<Vec<String>>("faculties").unwrap().unwrap();
        assert_eq!(persisted.value, list(&["fit", "econ"]));
        assert!(!persisted.is_expired());
    }
}
