//! Stale-while-revalidate cache engine.

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::entry::{CacheEntry, Freshness};
use super::key::QueryKey;
use super::types::{CacheOptions, QueryResult, QueryStatus};
use crate::backend::{Backend, Row, Select};
use crate::config::CacheConfig;
use crate::connection::{ConnectionManager, Handle};
use crate::error::{DataError, Result};
use crate::resilience::{with_timeout, RetryPolicy};

/// A boxed future that resolves to a fetched value
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A factory producing one fetch per call
type FetcherFn<B, T> = Arc<dyn Fn(Handle<B>) -> BoxFuture<T> + Send + Sync>;

type Listener<T> = Arc<dyn Fn(&QueryResult<T>) + Send + Sync>;

/// Listeners to call and the state to hand them, collected under the lock
/// and delivered after it is released.
type Notification<T> = (Vec<Listener<T>>, QueryResult<T>);

/// Everything the engine knows about one key.
struct Slot<B, T> {
  key: QueryKey,
  entry: Option<CacheEntry<T>>,
  error: Option<DataError>,
  loading: bool,
  /// Bumped for every fetch issued; only the newest may commit
  generation: u64,
  in_flight: Option<AbortHandle>,
  fetcher: Option<FetcherFn<B, T>>,
  options: CacheOptions,
  interval_task: Option<JoinHandle<()>>,
  listeners: Vec<(u64, Listener<T>)>,
}

impl<B, T: Clone> Slot<B, T> {
  fn new(key: QueryKey, options: CacheOptions) -> Self {
    Self {
      key,
      entry: None,
      error: None,
      loading: false,
      generation: 0,
      in_flight: None,
      fetcher: None,
      options,
      interval_task: None,
      listeners: Vec::new(),
    }
  }

  fn freshness(&self) -> Option<Freshness> {
    self.entry.as_ref().map(CacheEntry::freshness)
  }

  fn snapshot(&self) -> QueryResult<T> {
    let freshness = self.freshness();
    let data = match (freshness, &self.entry) {
      (Some(Freshness::Fresh | Freshness::Stale), Some(entry)) => Some(entry.value.clone()),
      _ => None,
    };
    let error = if data.is_none() {
      self.error.clone()
    } else {
      None
    };
    QueryResult {
      data,
      loading: self.loading,
      error,
      is_stale: freshness == Some(Freshness::Stale),
    }
  }

  fn status(&self) -> QueryStatus {
    if self.in_flight.is_some() {
      return QueryStatus::Fetching;
    }
    match self.freshness() {
      Some(Freshness::Fresh) => QueryStatus::Fresh,
      Some(Freshness::Stale) => QueryStatus::Stale,
      _ if self.error.is_some() => QueryStatus::Error,
      _ => QueryStatus::Idle,
    }
  }

  fn notification(&self) -> Option<Notification<T>> {
    if self.listeners.is_empty() {
      return None;
    }
    let listeners = self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
    Some((listeners, self.snapshot()))
  }

  fn is_idle(&self) -> bool {
    self.entry.is_none()
      && self.in_flight.is_none()
      && self.interval_task.is_none()
      && self.listeners.is_empty()
  }
}

fn deliver<T>(notification: Option<Notification<T>>) {
  if let Some((listeners, result)) = notification {
    for listener in listeners {
      listener(&result);
    }
  }
}

struct EngineInner<B: Backend, T> {
  manager: ConnectionManager<B>,
  defaults: CacheOptions,
  slots: Mutex<HashMap<String, Slot<B, T>>>,
  sweep_task: Mutex<Option<JoinHandle<()>>>,
  next_listener_id: AtomicU64,
}

/// In-memory query cache keyed by [`QueryKey`].
///
/// Reads return cached values immediately when possible and revalidate in
/// the background. Every fetch goes through the connection manager's
/// handle. The engine owns its timers (eviction sweep, per-key refetch
/// intervals); [`CacheEngine::shutdown`] stops them.
pub struct CacheEngine<B: Backend, T> {
  inner: Arc<EngineInner<B, T>>,
}

impl<B: Backend, T> Clone for CacheEngine<B, T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<B: Backend, T: Clone + Send + Sync + 'static> CacheEngine<B, T> {
  /// Create an engine and start its eviction sweep.
  pub fn new(manager: ConnectionManager<B>, config: &CacheConfig) -> Self {
    let engine = Self {
      inner: Arc::new(EngineInner {
        manager,
        defaults: CacheOptions::from(config),
        slots: Mutex::new(HashMap::new()),
        sweep_task: Mutex::new(None),
        next_listener_id: AtomicU64::new(1),
      }),
    };
    let period = Duration::from_secs(config.sweep_interval_secs.max(1));
    *engine.inner.sweep_task.lock() = Some(engine.spawn_sweeper(period));
    engine
  }

  /// Options built from the engine's configuration.
  pub fn default_options(&self) -> CacheOptions {
    self.inner.defaults.clone()
  }

  /// Read `key`, serving from cache when possible.
  ///
  /// - disabled: nothing happens, the current state is returned
  /// - fresh entry: returned, no network call
  /// - stale entry: returned with `is_stale`, one background refetch starts
  /// - no entry: fetched while the caller waits, bounded by `options.timeout`
  pub async fn execute<F, Fut>(&self, key: QueryKey, query_fn: F, options: CacheOptions) -> QueryResult<T>
  where
    F: Fn(Handle<B>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if !options.enabled {
      return self.snapshot(&key);
    }

    let hash = key.cache_hash();
    let fetcher: FetcherFn<B, T> = Arc::new(move |handle| Box::pin(query_fn(handle)));
    let timeout = options.timeout;

    let (pending, notification) = {
      let mut slots = self.inner.slots.lock();
      let slot = slots
        .entry(hash.clone())
        .or_insert_with(|| Slot::new(key.clone(), options.clone()));
      slot.fetcher = Some(fetcher);
      slot.options = options;
      self.ensure_interval(&hash, slot);

      match slot.freshness() {
        Some(Freshness::Fresh) => {
          debug!(key = %slot.key.description(), "Cache hit");
          return slot.snapshot();
        }
        Some(Freshness::Stale) => {
          let result = slot.snapshot();
          if slot.in_flight.is_none() {
            debug!(key = %slot.key.description(), "Serving stale entry, revalidating");
            self.start_fetch(&hash, slot);
          }
          return result;
        }
        Some(Freshness::Expired) => {
          slot.entry = None;
        }
        None => {}
      }

      debug!(key = %slot.key.description(), "Cache miss");
      let pending = self.start_fetch(&hash, slot);
      (pending, slot.notification())
    };
    deliver(notification);

    // A superseded fetch resolves to `Cancelled`; the caller then sees
    // whatever the newer fetch has produced so far.
    let outcome: Result<()> = match pending {
      Some(join) => {
        let wait = async move {
          join
            .await
            .unwrap_or(Err(DataError::Cancelled))
            .map(|_| ())
        };
        match timeout {
          Some(limit) => with_timeout(limit, wait).await,
          None => wait.await,
        }
      }
      None => Ok(()),
    };

    let mut result = self.snapshot(&key);
    if let Err(e @ DataError::Timeout(_)) = outcome {
      if result.data.is_none() {
        result.error = Some(e);
      }
    }
    result
  }

  /// Fetch `key` again now, replacing any fetch in flight, and wait for it.
  pub async fn refetch(&self, key: &QueryKey) -> QueryResult<T> {
    let hash = key.cache_hash();
    let (pending, notification) = {
      let mut slots = self.inner.slots.lock();
      let Some(slot) = slots.get_mut(&hash) else {
        return QueryResult::idle();
      };
      if !slot.options.enabled {
        return slot.snapshot();
      }
      let pending = self.start_fetch(&hash, slot);
      (pending, slot.notification())
    };
    deliver(notification);

    if let Some(join) = pending {
      let _ = join.await;
    }
    self.snapshot(key)
  }

  /// Window or tab regained focus: revalidate every key that opted in and
  /// is missing or stale.
  pub fn on_focus(&self) {
    let mut notifications = Vec::new();
    {
      let mut slots = self.inner.slots.lock();
      for (hash, slot) in slots.iter_mut() {
        let wants_refetch = slot.options.enabled
          && slot.options.refetch_on_focus
          && slot.in_flight.is_none()
          && slot.freshness() != Some(Freshness::Fresh);
        if wants_refetch && self.start_fetch(hash, slot).is_some() {
          notifications.push(slot.notification());
        }
      }
    }
    for notification in notifications {
      deliver(notification);
    }
  }

  /// Drop the cached value for `key`. Keys with subscribers are refetched
  /// right away.
  pub fn invalidate(&self, key: &QueryKey) {
    let hash = key.cache_hash();
    let notification = {
      let mut slots = self.inner.slots.lock();
      let Some(slot) = slots.get_mut(&hash) else {
        return;
      };
      slot.entry = None;
      slot.error = None;
      if !slot.listeners.is_empty() && slot.options.enabled {
        self.start_fetch(&hash, slot);
      }
      slot.notification()
    };
    deliver(notification);
  }

  /// Register `listener` for state changes of `key`. Dropping the returned
  /// [`Subscription`] unregisters it.
  pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
  where
    F: Fn(&QueryResult<T>) + Send + Sync + 'static,
  {
    let hash = key.cache_hash();
    let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
    {
      let mut slots = self.inner.slots.lock();
      let slot = slots
        .entry(hash.clone())
        .or_insert_with(|| Slot::new(key.clone(), self.inner.defaults.clone()));
      slot.listeners.push((id, Arc::new(listener)));
    }

    let weak: Weak<EngineInner<B, T>> = Arc::downgrade(&self.inner);
    Subscription {
      unsubscribe: Some(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
          if let Some(slot) = inner.slots.lock().get_mut(&hash) {
            slot.listeners.retain(|(lid, _)| *lid != id);
          }
        }
      })),
    }
  }

  /// Current state of `key` without fetching.
  pub fn snapshot(&self, key: &QueryKey) -> QueryResult<T> {
    self
      .inner
      .slots
      .lock()
      .get(&key.cache_hash())
      .map(Slot::snapshot)
      .unwrap_or_else(QueryResult::idle)
  }

  pub fn status(&self, key: &QueryKey) -> QueryStatus {
    self
      .inner
      .slots
      .lock()
      .get(&key.cache_hash())
      .map(Slot::status)
      .unwrap_or(QueryStatus::Idle)
  }

  /// Number of keys currently holding a value.
  pub fn len(&self) -> usize {
    self
      .inner
      .slots
      .lock()
      .values()
      .filter(|s| s.entry.is_some())
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Evict every entry older than its cache time. Returns how many were
  /// evicted. Runs periodically on its own; callable directly as well.
  pub fn sweep(&self) -> usize {
    let mut evicted = 0;
    self.inner.slots.lock().retain(|_, slot| {
      if slot.freshness() == Some(Freshness::Expired) {
        debug!(key = %slot.key.description(), age = ?slot.entry.as_ref().map(CacheEntry::age), "Evicting expired entry");
        slot.entry = None;
        evicted += 1;
      }
      !slot.is_idle()
    });
    evicted
  }

  /// Stop the sweep, every refetch interval and every fetch in flight.
  pub fn shutdown(&self) {
    if let Some(task) = self.inner.sweep_task.lock().take() {
      task.abort();
    }
    let mut slots = self.inner.slots.lock();
    for slot in slots.values_mut() {
      if let Some(task) = slot.interval_task.take() {
        task.abort();
      }
      if let Some(fetch) = slot.in_flight.take() {
        fetch.abort();
      }
    }
    slots.clear();
  }

  /// Issue a fetch for `slot`, aborting the one in flight. Called with the
  /// slot lock held; the fetch itself runs on its own task.
  fn start_fetch(&self, hash: &str, slot: &mut Slot<B, T>) -> Option<JoinHandle<Result<T>>> {
    let fetcher = slot.fetcher.clone()?;

    if let Some(previous) = slot.in_flight.take() {
      debug!(key = %slot.key.description(), "Aborting superseded fetch");
      previous.abort();
    }
    slot.generation += 1;
    slot.loading = slot.entry.is_none();

    let generation = slot.generation;
    let policy = RetryPolicy::linear(slot.options.retry_count, slot.options.retry_delay);
    let engine = Arc::clone(&self.inner);
    let hash = hash.to_string();

    let task = tokio::spawn(async move {
      let fetch = policy.run(&hash, |_| {
        let manager = engine.manager.clone();
        let fetcher = Arc::clone(&fetcher);
        async move { manager.with_session_recovery(move |handle| fetcher(handle)).await }
      });
      match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(result) => {
          engine.commit(&hash, generation, result.clone());
          result
        }
        Err(panic) => {
          engine.release(&hash, generation);
          std::panic::resume_unwind(panic)
        }
      }
    });
    slot.in_flight = Some(task.abort_handle());
    Some(task)
  }

  fn ensure_interval(&self, hash: &str, slot: &mut Slot<B, T>) {
    match (slot.options.refetch_interval, &slot.interval_task) {
      (Some(period), None) => {
        slot.interval_task = Some(self.spawn_interval(hash.to_string(), period));
      }
      (None, Some(_)) => {
        if let Some(task) = slot.interval_task.take() {
          task.abort();
        }
      }
      _ => {}
    }
  }

  fn spawn_interval(&self, hash: String, period: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let engine = CacheEngine { inner };
        let notification = {
          let mut slots = engine.inner.slots.lock();
          let Some(slot) = slots.get_mut(&hash) else {
            break;
          };
          if slot.options.enabled && slot.in_flight.is_none() {
            engine.start_fetch(&hash, slot);
            slot.notification()
          } else {
            None
          }
        };
        deliver(notification);
      }
    })
  }

  fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let evicted = CacheEngine { inner }.sweep();
        if evicted > 0 {
          debug!(evicted, "Eviction sweep");
        }
      }
    })
  }
}

impl<B: Backend, T: Clone> EngineInner<B, T> {
  /// Clear the in-flight marker of a fetch that died without a result.
  fn release(&self, hash: &str, generation: u64) {
    let notification = {
      let mut slots = self.slots.lock();
      let Some(slot) = slots.get_mut(hash) else {
        return;
      };
      if slot.generation != generation {
        return;
      }
      warn!(key = %slot.key.description(), "Fetch panicked");
      slot.in_flight = None;
      slot.loading = false;
      slot.notification()
    };
    deliver(notification);
  }

  /// Store the outcome of fetch `generation` unless a newer one was issued.
  fn commit(&self, hash: &str, generation: u64, result: Result<T>) {
    let notification = {
      let mut slots = self.slots.lock();
      let Some(slot) = slots.get_mut(hash) else {
        return;
      };
      if slot.generation != generation {
        debug!(key = %slot.key.description(), "Discarding superseded result");
        return;
      }

      slot.in_flight = None;
      slot.loading = false;
      match result {
        Ok(value) => {
          slot.entry = Some(CacheEntry::new(
            value,
            slot.options.stale_time,
            slot.options.cache_time,
          ));
          slot.error = None;
        }
        Err(e) if slot.entry.is_some() => {
          warn!(key = %slot.key.description(), error = %e, "Revalidation failed, keeping cached value");
        }
        Err(e) => {
          warn!(key = %slot.key.description(), error = %e, "Fetch failed");
          slot.error = Some(e);
        }
      }
      slot.notification()
    };
    deliver(notification);
  }
}

impl<B: Backend> CacheEngine<B, Vec<Row>> {
  /// Cached row read keyed by the query itself.
  pub async fn select(&self, query: Select, options: CacheOptions) -> QueryResult<Vec<Row>> {
    let key = QueryKey::from(&query);
    let query = Arc::new(query);
    self
      .execute(
        key,
        move |handle| {
          let query = Arc::clone(&query);
          async move { handle.select(&query).await }
        },
        options,
      )
      .await
  }
}

/// Keeps a listener registered; dropping it unsubscribes.
pub struct Subscription {
  unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(unsubscribe) = self.unsubscribe.take() {
      unsubscribe();
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::mock::{session, MockBackend};
  use crate::config::Config;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;

  type Fetch = BoxFuture<u32>;

  fn engine<T: Clone + Send + Sync + 'static>(backend: &MockBackend) -> CacheEngine<MockBackend, T> {
    let config = Config::new("https://shop.example.co", "anon");
    let backend = backend.clone();
    let manager = ConnectionManager::new(&config, move || backend.clone());
    CacheEngine::new(manager, &config.cache)
  }

  fn options() -> CacheOptions {
    CacheOptions::default()
      .with_stale_time(Duration::from_secs(10))
      .with_cache_time(Duration::from_secs(60))
      .with_retry(3, Duration::from_millis(100))
  }

  /// Query function returning the 1-based number of the call.
  fn counter(calls: &Arc<AtomicU32>) -> impl Fn(Handle<MockBackend>) -> Fetch + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_: Handle<MockBackend>| -> Fetch {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      Box::pin(async move { Ok(n) })
    }
  }

  fn failing(calls: &Arc<AtomicU32>) -> impl Fn(Handle<MockBackend>) -> Fetch + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_: Handle<MockBackend>| -> Fetch {
      calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async { Err(DataError::Network("connection reset".into())) })
    }
  }

  fn slow(value: u32, delay: Duration) -> impl Fn(Handle<MockBackend>) -> Fetch + Send + Sync + 'static {
    move |_: Handle<MockBackend>| -> Fetch {
      Box::pin(async move {
        tokio::time::sleep(delay).await;
        Ok(value)
      })
    }
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_served_without_fetch() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("products");

    let first = engine.execute(key.clone(), counter(&calls), options()).await;
    assert_eq!(first.data, Some(1));
    assert!(!first.loading);

    let second = engine.execute(key.clone(), counter(&calls), options()).await;
    assert_eq!(second.data, Some(1));
    assert!(!second.is_stale);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.status(&key), QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_served_and_revalidated_once() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("products");

    engine.execute(key.clone(), counter(&calls), options()).await;
    tokio::time::advance(Duration::from_secs(11)).await;

    let stale = engine.execute(key.clone(), counter(&calls), options()).await;
    assert_eq!(stale.data, Some(1));
    assert!(stale.is_stale);
    assert!(!stale.loading);
    assert_eq!(engine.status(&key), QueryStatus::Fetching);

    // Already revalidating: no second background fetch
    let again = engine.execute(key.clone(), counter(&calls), options()).await;
    assert_eq!(again.data, Some(1));

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let refreshed = engine.snapshot(&key);
    assert_eq!(refreshed.data, Some(2));
    assert!(!refreshed.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_after_exactly_n_attempts() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let flaky = move |_: Handle<MockBackend>| -> Fetch {
      let n = c.fetch_add(1, Ordering::SeqCst) + 1;
      Box::pin(async move {
        if n < 4 {
          Err(DataError::Network("flaky".into()))
        } else {
          Ok(n)
        }
      })
    };

    let result = engine
      .execute(
        QueryKey::new("orders"),
        flaky,
        options().with_retry(4, Duration::from_millis(100)),
      )
      .await;

    assert_eq!(result.data, Some(4));
    assert_eq!(result.error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_retries_surface_error_with_linear_backoff() {
    let engine = engine::<u32>(&MockBackend::new());
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    let s = Arc::clone(&stamps);
    let failing = move |_: Handle<MockBackend>| -> Fetch {
      s.lock().push(start.elapsed());
      Box::pin(async { Err(DataError::Network("down".into())) })
    };
    let key = QueryKey::new("orders");

    let result = engine
      .execute(
        key.clone(),
        failing,
        options().with_retry(3, Duration::from_millis(250)),
      )
      .await;

    assert_eq!(result.data, None);
    assert_eq!(result.error, Some(DataError::Network("down".into())));
    assert!(!result.loading);
    assert_eq!(engine.status(&key), QueryStatus::Error);

    let stamps = stamps.lock().clone();
    assert_eq!(stamps.len(), 3);
    assert_eq!(stamps[1] - stamps[0], Duration::from_millis(250));
    assert_eq!(stamps[2] - stamps[1], Duration::from_millis(500));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_value_preferred_over_error() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("products");

    engine.execute(key.clone(), counter(&calls), options()).await;
    tokio::time::advance(Duration::from_secs(11)).await;

    let failures = Arc::new(AtomicU32::new(0));
    let result = engine.execute(key.clone(), failing(&failures), options()).await;
    assert_eq!(result.data, Some(1));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 3);
    let after = engine.snapshot(&key);
    assert_eq!(after.data, Some(1));
    assert_eq!(after.error, None);
    assert!(after.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_absent_and_swept() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("categories");
    let short = options()
      .with_stale_time(Duration::from_secs(1))
      .with_cache_time(Duration::from_secs(5));

    engine.execute(key.clone(), counter(&calls), short.clone()).await;
    tokio::time::advance(Duration::from_secs(6)).await;

    assert_eq!(engine.snapshot(&key).data, None);
    assert_eq!(engine.len(), 1);
    assert_eq!(engine.sweep(), 1);
    assert!(engine.is_empty());

    // Next read is a cold fetch
    let result = engine.execute(key.clone(), counter(&calls), short).await;
    assert_eq!(result.data, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_background_sweeper_evicts() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let short = options()
      .with_stale_time(Duration::from_secs(1))
      .with_cache_time(Duration::from_secs(5));

    engine
      .execute(QueryKey::new("banners"), counter(&calls), short)
      .await;
    assert_eq!(engine.len(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(engine.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_rejected_session_recovered_before_retrying() {
    let backend = MockBackend::new();
    backend.set_refresh_result(Ok(session("rotated")));
    let config = Config::new("https://shop.example.co", "anon");
    let b = backend.clone();
    let manager = ConnectionManager::new(&config, move || b.clone());
    manager.sign_in("admin@shop.test", "correct horse").await.unwrap();
    let engine: CacheEngine<MockBackend, u32> = CacheEngine::new(manager, &config.cache);

    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let expiring = move |_: Handle<MockBackend>| -> Fetch {
      let n = c.fetch_add(1, Ordering::SeqCst) + 1;
      Box::pin(async move {
        if n == 1 {
          Err(DataError::Auth {
            code: "PGRST301".into(),
            message: "JWT expired".into(),
          })
        } else {
          Ok(n)
        }
      })
    };

    // A single attempt: the recovery retry is not part of the retry budget
    let result = engine
      .execute(
        QueryKey::new("orders"),
        expiring,
        options().with_retry(1, Duration::from_millis(100)),
      )
      .await;

    assert_eq!(result.data, Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(backend.refresh_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_fetch_releases_key() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let buggy = move |_: Handle<MockBackend>| -> Fetch {
      let n = c.fetch_add(1, Ordering::SeqCst) + 1;
      Box::pin(async move {
        if n == 1 {
          panic!("malformed row");
        }
        Ok(n)
      })
    };
    let key = QueryKey::new("products");

    let result = engine.execute(key.clone(), buggy.clone(), options()).await;
    assert_eq!(result.data, None);
    assert!(!result.loading);
    assert_eq!(engine.status(&key), QueryStatus::Idle);

    let retried = engine.execute(key.clone(), buggy, options()).await;
    assert_eq!(retried.data, Some(2));
    assert_eq!(engine.status(&key), QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_newest_fetch_wins() {
    let engine = engine::<u32>(&MockBackend::new());
    let key = QueryKey::new("cart");

    let e = engine.clone();
    let k = key.clone();
    let first = tokio::spawn(async move {
      e.execute(k, slow(1, Duration::from_millis(100)), options())
        .await
    });
    settle().await;
    assert_eq!(engine.status(&key), QueryStatus::Fetching);

    let second = engine
      .execute(key.clone(), slow(2, Duration::from_millis(100)), options())
      .await;
    let first = first.await.unwrap();

    assert_eq!(second.data, Some(2));
    assert_eq!(first.data, None);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.snapshot(&key).data, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_query_is_noop() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("products");

    let result = engine
      .execute(key.clone(), counter(&calls), options().with_enabled(false))
      .await;

    assert_eq!(result, QueryResult::idle());
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.status(&key), QueryStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_bounds_wait_but_not_fetch() {
    let engine = engine::<u32>(&MockBackend::new());
    let key = QueryKey::new("reports");
    let limit = crate::resilience::DEFAULT_READ_TIMEOUT;

    let result = engine
      .execute(
        key.clone(),
        slow(5, Duration::from_secs(10)),
        options().with_timeout(limit),
      )
      .await;
    assert_eq!(result.error, Some(DataError::Timeout(limit)));
    assert!(result.loading);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(engine.snapshot(&key).data, Some(5));
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscription_receives_updates_until_dropped() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("products");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    let subscription = engine.subscribe(&key, move |r: &QueryResult<u32>| s.lock().push(r.clone()));

    engine.execute(key.clone(), counter(&calls), options()).await;
    {
      let seen = seen.lock();
      assert_eq!(seen.len(), 2);
      assert!(seen[0].loading);
      assert_eq!(seen[0].data, None);
      assert!(!seen[1].loading);
      assert_eq!(seen[1].data, Some(1));
    }

    drop(subscription);
    let refetched = engine.refetch(&key).await;
    assert_eq!(refetched.data, Some(2));
    assert_eq!(seen.lock().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_focus_revalidates_only_stale_opted_in_keys() {
    let engine = engine::<u32>(&MockBackend::new());
    let stale_calls = Arc::new(AtomicU32::new(0));
    let fresh_calls = Arc::new(AtomicU32::new(0));
    let opted_out_calls = Arc::new(AtomicU32::new(0));

    engine
      .execute(QueryKey::new("stale"), counter(&stale_calls), options())
      .await;
    engine
      .execute(
        QueryKey::new("opted-out"),
        counter(&opted_out_calls),
        options().with_refetch_on_focus(false),
      )
      .await;
    tokio::time::advance(Duration::from_secs(11)).await;
    engine
      .execute(QueryKey::new("fresh"), counter(&fresh_calls), options())
      .await;

    engine.on_focus();
    settle().await;

    assert_eq!(stale_calls.load(Ordering::SeqCst), 2);
    assert_eq!(fresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(opted_out_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_interval() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("inventory");

    engine
      .execute(
        key.clone(),
        counter(&calls),
        options().with_refetch_interval(Duration::from_secs(10)),
      )
      .await;
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.snapshot(&key).data, Some(3));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_forces_next_fetch() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::new("products");

    engine.execute(key.clone(), counter(&calls), options()).await;
    engine.invalidate(&key);
    assert_eq!(engine.snapshot(&key).data, None);

    let result = engine.execute(key.clone(), counter(&calls), options()).await;
    assert_eq!(result.data, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_select_reads_through_handle() {
    let backend = MockBackend::new().with_rows(
      "products",
      vec![
        json!({"id": 1, "category": "shoes"}),
        json!({"id": 2, "category": "hats"}),
        json!({"id": 3, "category": "shoes"}),
      ],
    );
    let engine = engine::<Vec<Row>>(&backend);

    let query = Select::from("products").eq("category", "shoes");
    let result = engine.select(query.clone(), options()).await;
    assert_eq!(result.data.map(|rows| rows.len()), Some(2));

    let cached = engine.select(query, options()).await;
    assert!(cached.is_success());
    assert_eq!(backend.select_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_clears_everything() {
    let engine = engine::<u32>(&MockBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    engine
      .execute(
        QueryKey::new("inventory"),
        counter(&calls),
        options().with_refetch_interval(Duration::from_secs(10)),
      )
      .await;

    engine.shutdown();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(engine.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
