use std::time::Duration;
use tokio::time::Instant;

/// Age classification of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// `age <= stale_time`: served without a network call
  Fresh,
  /// `stale_time < age <= cache_time`: served, revalidated in the background
  Stale,
  /// `age > cache_time`: treated as absent and swept
  Expired,
}

/// A successfully fetched value and the timing rules it was stored under.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub value: T,
  pub fetched_at: Instant,
  pub stale_time: Duration,
  pub cache_time: Duration,
}

impl<T> CacheEntry<T> {
  pub fn new(value: T, stale_time: Duration, cache_time: Duration) -> Self {
    Self {
      value,
      fetched_at: Instant::now(),
      stale_time,
      cache_time,
    }
  }

  pub fn age(&self) -> Duration {
    self.fetched_at.elapsed()
  }

  pub fn freshness(&self) -> Freshness {
    let age = self.age();
    if age > self.cache_time {
      Freshness::Expired
    } else if age > self.stale_time {
      Freshness::Stale
    } else {
      Freshness::Fresh
    }
  }
}
