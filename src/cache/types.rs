//! Options and results of cached reads.

use std::time::Duration;

use crate::config::CacheConfig;
use crate::error::DataError;

/// Per-query caching and retry behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
  /// How long a value is served without revalidation
  pub stale_time: Duration,
  /// How long a value is kept at all
  pub cache_time: Duration,
  /// Total fetch attempts, including the first
  pub retry_count: u32,
  /// Base delay; the wait after attempt `n` is `retry_delay × n`
  pub retry_delay: Duration,
  pub refetch_on_focus: bool,
  pub refetch_interval: Option<Duration>,
  /// When false, `execute` neither reads nor fetches
  pub enabled: bool,
  /// Bound on how long a cold read keeps the caller waiting
  pub timeout: Option<Duration>,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self::from(&CacheConfig::default())
  }
}

impl From<&CacheConfig> for CacheOptions {
  fn from(config: &CacheConfig) -> Self {
    Self {
      stale_time: Duration::from_secs(config.stale_time_secs),
      cache_time: Duration::from_secs(config.cache_time_secs),
      retry_count: config.retry_count,
      retry_delay: Duration::from_millis(config.retry_delay_ms),
      refetch_on_focus: true,
      refetch_interval: None,
      enabled: true,
      timeout: None,
    }
  }
}

impl CacheOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
    self.cache_time = cache_time;
    self
  }

  pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
    self.retry_count = retry_count;
    self.retry_delay = retry_delay;
    self
  }

  pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
    self.refetch_on_focus = enabled;
    self
  }

  pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
    self.refetch_interval = Some(interval);
    self
  }

  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// What a caller sees for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
  pub data: Option<T>,
  /// Raised only while a key without data is being fetched
  pub loading: bool,
  /// Only set when there is no data to fall back on
  pub error: Option<DataError>,
  pub is_stale: bool,
}

impl<T> QueryResult<T> {
  pub fn idle() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      is_stale: false,
    }
  }

  pub fn is_success(&self) -> bool {
    self.data.is_some()
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

/// Lifecycle of a key.
///
/// `Idle → Fetching → {Fresh | Stale | Error}`; a stale key loops through
/// `Fetching` in the background without involving any caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  Idle,
  Fetching,
  Fresh,
  Stale,
  Error,
}
