//! Idempotent execution with in-flight coalescing.
//!
//! [`IdempotencyStore::execute`] runs an operation at most once per key at a
//! time and caches its successful result for a time-to-live:
//! - a non-expired cached result is returned without running the operation
//! - concurrent callers for a key that is already executing await the same
//!   execution and observe the same outcome
//! - failures are never cached, so a later call runs the operation again
//!
//! The operation runs on its own task. It finishes and settles the cache
//! entry even if every caller stops waiting for it.
//!
//! Expired results are swept when a new execution starts, at most once per
//! time-to-live, so the table holds at most the keys seen within about two
//! TTLs plus those in flight.

use courier_core::DispatchError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Idempotency store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a successful result is reused
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdempotencyStats {
    /// Calls answered from a cached result
    pub hits: u64,
    /// Calls that started a new execution
    pub misses: u64,
    /// Calls that joined an execution already in flight
    pub coalesced: u64,
    /// Unexpired cached results
    pub completed: usize,
    /// Executions currently in flight
    pub in_flight: usize,
}

impl IdempotencyStats {
    /// Share of calls that did not start a new execution, as a percentage
    #[must_use]
    pub fn dedup_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.coalesced) as f64 / total as f64 * 100.0
        }
    }
}

type SharedExecution<T> = Shared<BoxFuture<'static, Result<T, DispatchError>>>;

enum Slot<T> {
    InFlight {
        generation: u64,
        execution: SharedExecution<T>,
    },
    Completed {
        value: T,
        expires_at: Instant,
    },
}

enum Lookup<T> {
    Hit(T),
    Join(SharedExecution<T>),
    Miss,
}

type Slots<T> = Arc<Mutex<HashMap<String, Slot<T>>>>;

/// Keyed store that executes each operation at most once concurrently and
/// remembers successful results
pub struct IdempotencyStore<T> {
    config: IdempotencyConfig,
    slots: Slots<T>,
    next_sweep: Mutex<Instant>,
    next_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl<T> IdempotencyStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new store
    #[must_use]
    pub fn new(config: IdempotencyConfig) -> Self {
        let first_sweep = Instant::now() + config.ttl;
        Self {
            config,
            next_sweep: Mutex::new(first_sweep),
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(IdempotencyConfig::default())
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Run `op` for `key` unless a result is cached or an execution is in flight.
    ///
    /// `op` is called at most once per invocation, and only when this call
    /// starts a new execution. It must return a `'static` future because the
    /// execution is driven on its own task.
    ///
    /// # Errors
    /// Returns the error produced by the shared execution, or
    /// `DispatchError::Internal` if the execution task was aborted
    pub async fn execute<F, Fut>(&self, key: &str, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>> + Send + 'static,
    {
        let execution = {
            let mut slots = self.slots.lock();
            let lookup = match slots.get(key) {
                Some(Slot::Completed { value, expires_at }) if Instant::now() < *expires_at => {
                    Lookup::Hit(value.clone())
                }
                Some(Slot::InFlight { execution, .. }) => Lookup::Join(execution.clone()),
                _ => Lookup::Miss,
            };

            match lookup {
                Lookup::Hit(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "Idempotency hit");
                    return Ok(value);
                }
                Lookup::Join(execution) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "Joining in-flight execution");
                    execution
                }
                Lookup::Miss => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.sweep_if_due(&mut slots);
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let execution = self.spawn_execution(key.to_string(), generation, op());
                    slots.insert(
                        key.to_string(),
                        Slot::InFlight {
                            generation,
                            execution: execution.clone(),
                        },
                    );
                    debug!(key, generation, "Started idempotent execution");
                    execution
                }
            }
        };

        execution.await
    }

    fn sweep_if_due(&self, slots: &mut HashMap<String, Slot<T>>) {
        let now = Instant::now();
        let mut next_sweep = self.next_sweep.lock();
        if now < *next_sweep {
            return;
        }
        *next_sweep = now + self.config.ttl;
        let removed = remove_expired(slots, now);
        if removed > 0 {
            debug!(removed, remaining = slots.len(), "Swept expired idempotency records");
        }
    }

    fn spawn_execution<Fut>(&self, key: String, generation: u64, fut: Fut) -> SharedExecution<T>
    where
        Fut: Future<Output = Result<T, DispatchError>> + Send + 'static,
    {
        let ttl = self.config.ttl;
        let task_slots = Arc::clone(&self.slots);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let result = fut.await;
            let mut slots = task_slots.lock();
            if owns_slot(&slots, &task_key, generation) {
                match &result {
                    Ok(value) => {
                        slots.insert(
                            task_key,
                            Slot::Completed {
                                value: value.clone(),
                                expires_at: Instant::now() + ttl,
                            },
                        );
                    }
                    Err(_) => {
                        slots.remove(&task_key);
                    }
                }
            }
            result
        });

        let slots = Arc::clone(&self.slots);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(key = %key, error = %join_err, "Idempotent execution aborted");
                    let mut slots = slots.lock();
                    if owns_slot(&slots, &key, generation) {
                        slots.remove(&key);
                    }
                    Err(DispatchError::internal(format!(
                        "idempotent execution for {key} aborted: {join_err}"
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Cached result for `key`, if present and not expired
    #[must_use]
    pub fn get(&self, key: &str) -> Option<T> {
        match self.slots.lock().get(key) {
            Some(Slot::Completed { value, expires_at }) if Instant::now() < *expires_at => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    /// Check whether an execution for `key` is in flight
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::InFlight { .. }))
    }

    /// Drop the cached result for `key`.
    ///
    /// An in-flight execution is left alone. Returns whether a result was removed.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Completed { .. })) {
            slots.remove(key);
            true
        } else {
            false
        }
    }

    /// Remove expired results
    pub fn purge_expired(&self) -> usize {
        let removed = remove_expired(&mut self.slots.lock(), Instant::now());
        if removed > 0 {
            debug!(removed, "Expired idempotency records removed");
        }
        removed
    }

    /// Drop every cached result; in-flight executions keep running
    pub fn clear(&self) {
        self.slots
            .lock()
            .retain(|_, slot| matches!(slot, Slot::InFlight { .. }));
        debug!("Idempotency store cleared");
    }

    /// Number of tracked keys, cached or in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Check if the store tracks no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> IdempotencyStats {
        let now = Instant::now();
        let (completed, in_flight) = self.slots.lock().values().fold((0, 0), |(c, f), slot| {
            match slot {
                Slot::Completed { expires_at, .. } if now < *expires_at => (c + 1, f),
                Slot::Completed { .. } => (c, f),
                Slot::InFlight { .. } => (c, f + 1),
            }
        });
        IdempotencyStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            completed,
            in_flight,
        }
    }
}

fn remove_expired<T>(slots: &mut HashMap<String, Slot<T>>, now: Instant) -> usize {
    let before = slots.len();
    slots.retain(|_, slot| match slot {
        Slot::Completed { expires_at, .. } => now < *expires_at,
        Slot::InFlight { .. } => true,
    });
    before - slots.len()
}

fn owns_slot<T>(slots: &HashMap<String, Slot<T>>, key: &str, generation: u64) -> bool {
    matches!(
        slots.get(key),
        Some(Slot::InFlight { generation: current, .. }) if *current == generation
    )
}

impl<T> std::fmt::Debug for IdempotencyStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("config", &self.config)
            .field("keys", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}
