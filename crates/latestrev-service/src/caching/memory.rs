use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::utils::defer::defer;

use super::CacheEntry;

/// How [`SingleFlightCache::resolve`] treats an entry whose TTL has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleMode {
    /// Treat the stale entry as missing and wait for a fresh value.
    Blocking,
    /// Return the stale value right away and refresh it in the background.
    Lazy,
}

/// Time-to-live settings of a [`SingleFlightCache`].
#[derive(Debug, Clone, Default)]
struct TtlConfig {
    /// Applies to all keys without a more specific TTL. `None` never expires.
    default: Option<Duration>,
    by_key: HashMap<String, Duration>,
}

impl TtlConfig {
    /// Explicit TTL wins over the per-key TTL, which wins over the default.
    fn resolve(&self, key: &str, explicit: Option<Duration>) -> Option<Duration> {
        explicit
            .or_else(|| self.by_key.get(key).copied())
            .or(self.default)
    }
}

/// A resolved value together with its expiry.
#[derive(Debug)]
struct InMemoryItem<V> {
    /// When this item turns stale. It is never evicted, only refreshed or overwritten.
    deadline: Option<Instant>,
    value: V,
}

impl<V> InMemoryItem<V> {
    fn new(value: V, ttl: Option<Duration>) -> Self {
        let deadline = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        Self { deadline, value }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| now < deadline)
    }
}

type Computation<V> = Shared<BoxFuture<'static, CacheEntry<V>>>;

struct State<V> {
    entries: HashMap<String, InMemoryItem<V>>,
    /// Currently running computations, tagged with a unique id.
    computations: HashMap<String, (u64, Computation<V>)>,
    next_id: u64,
}

/// A keyed in-memory cache that runs at most one computation per key at a time.
///
/// Concurrent [`resolve`](Self::resolve) calls for the same key all await the same computation
/// and observe the same result, be it a value or an error. Only successful results are stored.
///
/// Computations are spawned onto the runtime, so a caller that goes away does not cancel work
/// that other callers are waiting on.
pub struct SingleFlightCache<V> {
    /// Cache identifier used for metric names.
    name: &'static str,
    ttl: Arc<TtlConfig>,
    state: Arc<Mutex<State<V>>>,
}

impl<V> Clone for SingleFlightCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            ttl: Arc::clone(&self.ttl),
            state: Arc::clone(&self.state),
        }
    }
}

impl<V> std::fmt::Debug for SingleFlightCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (entries, computations) = self
            .state
            .try_lock()
            .map(|s| (s.entries.len(), s.computations.len()))
            .unwrap_or_default();
        f.debug_struct("SingleFlightCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("in-memory items", &entries)
            .field("running computations", &computations)
            .finish()
    }
}

impl<V> SingleFlightCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache whose entries expire after `default_ttl`, or never if it is `None`.
    pub fn new(name: &'static str, default_ttl: Option<Duration>) -> Self {
        let ttl = TtlConfig {
            default: default_ttl,
            by_key: HashMap::new(),
        };
        let state = State {
            entries: HashMap::new(),
            computations: HashMap::new(),
            next_id: 0,
        };
        Self {
            name,
            ttl: Arc::new(ttl),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Configures a TTL for a single key, overriding the default.
    pub fn with_key_ttl(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        Arc::make_mut(&mut self.ttl).by_key.insert(key.into(), ttl);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the value for `key`, computing it with `factory` if necessary.
    ///
    /// A fresh entry is returned without calling `factory`. A missing entry is computed, and so
    /// is a stale one when `mode` is [`StaleMode::Blocking`]. With [`StaleMode::Lazy`] a stale
    /// value is returned immediately while the refresh runs in the background, its failures
    /// are only logged.
    ///
    /// `ttl` overrides the TTLs configured for this cache.
    pub async fn resolve<F, Fut>(
        &self,
        key: &str,
        factory: F,
        ttl: Option<Duration>,
        mode: StaleMode,
    ) -> CacheEntry<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1, "cache" => self.name);

        let computation = {
            let mut state = self.lock();
            let now = Instant::now();
            let cached = state
                .entries
                .get(key)
                .map(|item| (item.is_fresh(now), item.value.clone()));

            match cached {
                Some((true, value)) => {
                    metric!(counter("caches.memory.hit") += 1, "cache" => self.name);
                    tracing::trace!(cache = self.name, key, "Serving fresh entry");
                    return Ok(value);
                }
                Some((false, value)) if mode == StaleMode::Lazy => {
                    let (computation, started) =
                        self.start_computation(&mut state, key, factory, ttl);
                    drop(state);

                    if started {
                        self.log_lazy_refresh(key, computation);
                    }
                    metric!(counter("caches.memory.hit") += 1, "cache" => self.name);
                    return Ok(value);
                }
                _ => self.start_computation(&mut state, key, factory, ttl).0,
            }
        };

        computation.await
    }

    /// Returns the running computation for `key`, or starts a new one.
    ///
    /// Must be called with the state lock held, which makes checking for and registering a
    /// computation atomic. Also returns whether a new computation was started.
    fn start_computation<F, Fut>(
        &self,
        state: &mut State<V>,
        key: &str,
        factory: F,
        ttl: Option<Duration>,
    ) -> (Computation<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<V>> + Send + 'static,
    {
        if let Some((_, computation)) = state.computations.get(key) {
            return (computation.clone(), false);
        }

        state.next_id += 1;
        let id = state.next_id;
        let ttl = self.ttl.resolve(key, ttl);
        let future = factory();

        let name = self.name;
        let task_key = key.to_owned();
        let shared_state = Arc::clone(&self.state);
        let computation = async move {
            // Unregisters the computation if it fails, panics, or gets dropped.
            let _done_token = {
                let state = Arc::clone(&shared_state);
                let key = task_key.clone();
                defer(move || {
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    if matches!(state.computations.get(&key), Some((current, _)) if *current == id)
                    {
                        state.computations.remove(&key);
                    }
                })
            };

            metric!(counter("caches.computation") += 1, "cache" => name);
            tracing::trace!(cache = name, key = task_key, "Computing entry");
            let result = future.await;

            if let Ok(value) = &result {
                let mut state = shared_state.lock().unwrap_or_else(PoisonError::into_inner);
                state
                    .entries
                    .insert(task_key.clone(), InMemoryItem::new(value.clone(), ttl));
                state.computations.remove(&task_key);
            }

            result
        }
        .boxed()
        .shared();

        state
            .computations
            .insert(key.to_owned(), (id, computation.clone()));

        let driver = computation.clone().map(drop);
        tokio::spawn(driver.bind_hub(Hub::new_from_top(Hub::current())));

        (computation, true)
    }

    fn log_lazy_refresh(&self, key: &str, computation: Computation<V>) {
        metric!(counter("caches.lazy_refresh") += 1, "cache" => self.name);
        let name = self.name;
        let key = key.to_owned();
        tokio::spawn(async move {
            if let Err(err) = computation.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    cache = name,
                    key,
                    "Background refresh failed, keeping stale entry",
                );
            }
        });
    }

    /// Reads the value for `key` without ever computing it.
    ///
    /// Stale entries are only returned when `allow_expired` is set.
    pub fn get(&self, key: &str, allow_expired: bool) -> Option<V> {
        let state = self.lock();
        let item = state.entries.get(key)?;
        (allow_expired || item.is_fresh(Instant::now())).then(|| item.value.clone())
    }

    /// Unconditionally stores `value` under `key`.
    ///
    /// `ttl` overrides the TTLs configured for this cache.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let ttl = self.ttl.resolve(key, ttl);
        self.lock()
            .entries
            .insert(key.to_owned(), InMemoryItem::new(value, ttl));
    }

    /// The number of stored entries, fresh and stale.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
