//! Single-flight cache registry.
//!
//! A lookup that misses takes the key's lease and spawns the upstream
//! computation on a Tokio task. Every other caller for the same key
//! subscribes to that task's result through a `watch` channel instead of
//! computing again. The task publishes the entry before it releases the
//! lease, so a caller that finds no lease is guaranteed to see the entry.
//!
//! Waiters are reference counted: when the last one goes away before the
//! result arrives, the task is aborted and the key reverts to `Missing`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::AbortHandle;

use crate::clock::{Clock, SystemClock, add_std};
use crate::{CacheError, CacheState, CacheStatus, Priority};

/// Payload check run on every read; returning `false` marks the entry
/// as corrupt.
pub type Validator<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long a published entry stays fresh.
    pub ttl: Duration,
    /// How long a computation may hold a key before another caller may
    /// take it over.
    pub lease_timeout: Duration,
    /// Deadline for a single upstream computation.
    pub compute_deadline: Duration,
    /// Concurrent upstream computations for interactive requests.
    pub interactive_permits: usize,
    /// Concurrent upstream computations for background warming.
    pub background_permits: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            lease_timeout: Duration::from_secs(10),
            compute_deadline: Duration::from_secs(5),
            interactive_permits: 64,
            background_permits: 8,
        }
    }
}

/// A published, immutable cache entry.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub payload: V,
    /// When the value was published.
    pub computed_at: DateTime<Utc>,
    /// When the value stops being fresh. Always after `computed_at`.
    pub expires_at: DateTime<Utc>,
    generation: u64,
    version: u64,
}

type Outcome<V, E> = Option<Result<V, E>>;

struct Flight<V, E> {
    id: u64,
    priority: Priority,
    waiters: AtomicUsize,
    lease_expires_ms: Arc<AtomicI64>,
    promote: Arc<Notify>,
    result: watch::Receiver<Outcome<V, E>>,
    abort: AbortHandle,
}

impl<V, E> Flight<V, E> {
    /// Whether the flight still holds its lease and has not produced a
    /// result yet. A flight queued for a permit holds its lease until the
    /// compute deadline ends the wait.
    fn in_progress(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_ms.load(Ordering::Acquire) > now.timestamp_millis()
            && self.result.borrow().is_none()
    }
}

enum Lookup<V, E> {
    Hit(V),
    Wait(Arc<Flight<V, E>>),
}

/// Keyed cache with per-key leases and single-flight computation.
///
/// `V` is the cached payload and `E` the caller's error type; both are
/// cloned once per waiter when a shared computation completes.
pub struct CacheRegistry<V, E = CacheError> {
    name: &'static str,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    validator: Option<Validator<V>>,
    entries: RwLock<HashMap<String, Arc<CacheEntry<V>>>>,
    flights: Mutex<HashMap<String, Arc<Flight<V, E>>>>,
    generation: AtomicU64,
    version: AtomicU64,
    next_flight: AtomicU64,
    interactive: Arc<Semaphore>,
    background: Arc<Semaphore>,
}

impl<V, E> std::fmt::Debug for CacheRegistry<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("version", &self.version.load(Ordering::Relaxed))
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<V, E> CacheRegistry<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + From<CacheError> + Send + Sync + 'static,
{
    /// Creates a registry on the system clock.
    #[must_use]
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Creates a registry reading time from `clock`.
    #[must_use]
    pub fn with_clock(name: &'static str, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let interactive = Arc::new(Semaphore::new(config.interactive_permits.max(1)));
        let background = Arc::new(Semaphore::new(config.background_permits.max(1)));
        Self {
            name,
            config,
            clock,
            validator: None,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            version: AtomicU64::new(0),
            next_flight: AtomicU64::new(0),
            interactive,
            background,
        }
    }

    /// Installs a payload validator used to detect corrupt entries.
    #[must_use]
    pub fn with_validator(mut self, validator: Validator<V>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Current time on the registry's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current key version. Bumped by [`Self::invalidate_all`].
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Returns the cached value for `key`, computing it with `compute` on a
    /// miss.
    ///
    /// Concurrent callers for the same key share one computation. Stale
    /// entries are recomputed, not served.
    ///
    /// # Errors
    ///
    /// Returns the computation's own error, or a [`CacheError`] converted
    /// into `E` when the computation times out or is abandoned.
    pub async fn get_or_compute<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        priority: Priority,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(hit) = self.peek(key) {
            log::trace!("[{}] hit '{key}'", self.name);
            return Ok(hit);
        }

        let flight = match self.join_or_start(key, priority, compute) {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Wait(flight) => flight,
        };

        let mut waiter = Waiter {
            registry: self,
            key,
            flight,
            finished: false,
        };
        waiter.wait().await
    }

    /// Returns the value only if a fresh entry exists.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        self.entry(key)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.payload.clone())
    }

    /// Reports the lifecycle state of `key`.
    #[must_use]
    pub fn status(&self, key: &str) -> CacheStatus {
        let now = self.clock.now();
        let computing = lock(&self.flights)
            .get(key)
            .is_some_and(|flight| flight.in_progress(now));
        let Some(entry) = self.entry(key) else {
            return if computing {
                CacheStatus {
                    state: CacheState::Computing,
                    ..CacheStatus::missing()
                }
            } else {
                CacheStatus::missing()
            };
        };

        let fresh = self.is_fresh(&entry, now);
        let state = if computing {
            CacheState::Computing
        } else if fresh {
            CacheState::Fresh
        } else {
            CacheState::Stale
        };

        CacheStatus {
            state,
            is_cached: fresh,
            last_updated: Some(entry.computed_at),
            expires_at: Some(entry.expires_at),
        }
    }

    /// Marks every published entry stale without discarding it.
    pub fn mark_all_stale(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("[{}] marked all entries stale (generation {generation})", self.name);
    }

    /// Drops the entry for one key.
    pub fn invalidate(&self, key: &str) {
        write(&self.entries).remove(key);
    }

    /// Drops every entry and bumps the key version.
    ///
    /// Computations already running finish for their current waiters but
    /// no longer publish; new callers start fresh computations.
    pub fn invalidate_all(&self) {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let dropped = {
            let mut entries = write(&self.entries);
            let n = entries.len();
            entries.clear();
            n
        };
        lock(&self.flights).clear();
        log::info!(
            "[{}] invalidated {dropped} entries, now at version {version}",
            self.name
        );
    }

    /// Removes entries that expired before now. Returns how many were
    /// removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let version = self.version();
        let mut entries = write(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.version == version && entry.expires_at > now);
        before - entries.len()
    }

    /// Number of published entries, fresh or stale.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    /// Whether no entries are published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, entry: &CacheEntry<V>, now: DateTime<Utc>) -> bool {
        now < entry.expires_at && entry.generation >= self.generation.load(Ordering::Acquire)
    }

    /// Loads the entry for `key` if it belongs to the current version and
    /// passes validation. Corrupt entries are dropped and logged.
    fn entry(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        let entry = read(&self.entries).get(key).cloned()?;
        if entry.version != self.version() {
            return None;
        }

        let valid = entry.expires_at > entry.computed_at
            && self
                .validator
                .as_ref()
                .is_none_or(|validate| validate(&entry.payload));
        if !valid {
            log::error!(
                "[{}] cache corruption detected for '{key}', invalidating entry",
                self.name
            );
            self.invalidate(key);
            return None;
        }

        Some(entry)
    }

    fn join_or_start<F, Fut>(self: &Arc<Self>, key: &str, priority: Priority, compute: F) -> Lookup<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut flights = lock(&self.flights);

        // Results are published before their lease is released, so a
        // second look under the lock cannot miss a just-finished flight.
        if let Some(hit) = self.peek(key) {
            return Lookup::Hit(hit);
        }

        let now = self.clock.now();
        if let Some(existing) = flights.get(key) {
            if existing.in_progress(now) {
                existing.waiters.fetch_add(1, Ordering::AcqRel);
                if priority == Priority::Interactive && existing.priority == Priority::Background {
                    existing.promote.notify_one();
                }
                log::trace!("[{}] joined in-flight computation for '{key}'", self.name);
                return Lookup::Wait(Arc::clone(existing));
            }
            log::warn!(
                "[{}] lease for '{key}' expired, taking over the computation",
                self.name
            );
            existing.abort.abort();
        }

        let flight = self.start_flight(key, priority, compute);
        flights.insert(key.to_owned(), Arc::clone(&flight));
        Lookup::Wait(flight)
    }

    fn start_flight<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        priority: Priority,
        compute: F,
    ) -> Arc<Flight<V, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let lease_expires_ms = Arc::new(AtomicI64::new(QUEUED_LEASE));
        let promote = Arc::new(Notify::new());
        let (tx, rx) = watch::channel(None);

        let registry = Arc::clone(self);
        let task_key = key.to_owned();
        let task_lease = Arc::clone(&lease_expires_ms);
        let task_promote = Arc::clone(&promote);
        let generation = self.generation.load(Ordering::Acquire);
        let version = self.version();

        log::debug!("[{}] computing '{key}' ({priority})", self.name);

        let handle = tokio::spawn(async move {
            let _lease = LeaseRelease {
                registry: Arc::clone(&registry),
                key: task_key.clone(),
                id,
            };
            let result = registry
                .run_compute(&task_key, priority, &task_lease, &task_promote, compute)
                .await;
            if let Ok(value) = &result {
                registry.publish(&task_key, value.clone(), generation, version);
            }
            tx.send_replace(Some(result));
        });

        Arc::new(Flight {
            id,
            priority,
            waiters: AtomicUsize::new(1),
            lease_expires_ms,
            promote,
            result: rx,
            abort: handle.abort_handle(),
        })
    }

    async fn run_compute<F, Fut>(
        &self,
        key: &str,
        priority: Priority,
        lease_expires_ms: &AtomicI64,
        promote: &Notify,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let deadline = self.config.compute_deadline;
        let deadline_at = tokio::time::Instant::now() + deadline;

        let acquire = async {
            match priority {
                Priority::Interactive => Arc::clone(&self.interactive).acquire_owned().await,
                Priority::Background => {
                    tokio::select! {
                        permit = Arc::clone(&self.background).acquire_owned() => permit,
                        () = promote.notified() => {
                            log::debug!("[{}] promoted '{key}' to the interactive pool", self.name);
                            Arc::clone(&self.interactive).acquire_owned().await
                        }
                    }
                }
            }
        };
        let _permit = match tokio::time::timeout_at(deadline_at, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(CacheError::PoolClosed { pool: priority }.into()),
            Err(_) => {
                log::warn!(
                    "[{}] no {priority} permit for '{key}' within {}ms",
                    self.name,
                    deadline.as_millis()
                );
                return Err(timeout_error(key, deadline).into());
            }
        };

        let renewed = add_std(self.clock.now(), self.config.lease_timeout);
        lease_expires_ms.store(renewed.timestamp_millis(), Ordering::Release);

        if let Ok(result) = tokio::time::timeout_at(deadline_at, compute()).await {
            result
        } else {
            log::warn!(
                "[{}] computation for '{key}' timed out after {}ms",
                self.name,
                deadline.as_millis()
            );
            Err(timeout_error(key, deadline).into())
        }
    }

    fn publish(&self, key: &str, payload: V, generation: u64, version: u64) {
        if self.version() != version {
            log::debug!(
                "[{}] discarding result for '{key}' computed against version {version}",
                self.name
            );
            return;
        }

        let computed_at = self.clock.now();
        let ttl = self.config.ttl.max(Duration::from_millis(1));
        let mut expires_at = add_std(computed_at, ttl);

        let mut entries = write(&self.entries);
        if let Some(previous) = entries.get(key)
            && previous.version == version
            && previous.expires_at > expires_at
        {
            expires_at = previous.expires_at;
        }
        entries.insert(
            key.to_owned(),
            Arc::new(CacheEntry {
                payload,
                computed_at,
                expires_at,
                generation,
                version,
            }),
        );
    }

    fn release_lease(&self, key: &str, id: u64) {
        let mut flights = lock(&self.flights);
        if flights.get(key).is_some_and(|flight| flight.id == id) {
            flights.remove(key);
        }
    }
}

/// Removes a flight's lease when its task ends, however it ends.
struct LeaseRelease<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + From<CacheError> + Send + Sync + 'static,
{
    registry: Arc<CacheRegistry<V, E>>,
    key: String,
    id: u64,
}

impl<V, E> Drop for LeaseRelease<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + From<CacheError> + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.registry.release_lease(&self.key, self.id);
    }
}

/// One caller waiting on a flight.
struct Waiter<'a, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + From<CacheError> + Send + Sync + 'static,
{
    registry: &'a Arc<CacheRegistry<V, E>>,
    key: &'a str,
    flight: Arc<Flight<V, E>>,
    finished: bool,
}

impl<V, E> Waiter<'_, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + From<CacheError> + Send + Sync + 'static,
{
    async fn wait(&mut self) -> Result<V, E> {
        let mut rx = self.flight.result.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        self.finished = true;

        outcome.unwrap_or_else(|| {
            Err(CacheError::Abandoned {
                key: self.key.to_owned(),
            }
            .into())
        })
    }
}

impl<V, E> Drop for Waiter<'_, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + From<CacheError> + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut flights = lock(&self.registry.flights);
        let remaining = self.flight.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 || self.finished {
            return;
        }

        self.flight.abort.abort();
        if flights
            .get(self.key)
            .is_some_and(|flight| flight.id == self.flight.id)
        {
            flights.remove(self.key);
        }
        log::debug!(
            "[{}] last waiter for '{}' left, computation cancelled",
            self.registry.name,
            self.key
        );
    }
}

/// Lease of a flight still waiting for a permit.
const QUEUED_LEASE: i64 = i64::MAX;

fn timeout_error(key: &str, deadline: Duration) -> CacheError {
    CacheError::ComputeTimeout {
        key: key.to_owned(),
        deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
