//! Retry with backoff and caller-side timeouts.
//!
//! Both the cache engine and the mutation coordinator retry transient
//! failures, with different delay curves:
//!
//! ```text
//! Attempt  Linear (1s)  Exponential (1s)
//! -------  -----------  ----------------
//! 1        1s           1s
//! 2        2s           2s
//! 3        3s           4s
//! 4        4s           8s
//! ```
//!
//! The delay listed for attempt `n` is the wait *after* attempt `n` fails.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DataError, Result};

/// Timeout applied to reads that must not keep a caller waiting.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
  /// `base × attempt`
  Linear(Duration),
  /// `base × 2^(attempt - 1)`
  Exponential(Duration),
}

impl Backoff {
  /// Delay to wait after the given (1-indexed) attempt fails.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    match *self {
      Self::Linear(base) => base.saturating_mul(attempt),
      Self::Exponential(base) => {
        let factor = 2u32.saturating_pow(attempt - 1);
        base.saturating_mul(factor)
      }
    }
  }
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first. Zero behaves like one.
  pub max_attempts: u32,
  pub backoff: Backoff,
}

impl RetryPolicy {
  pub fn linear(max_attempts: u32, base: Duration) -> Self {
    Self {
      max_attempts,
      backoff: Backoff::Linear(base),
    }
  }

  pub fn exponential(max_attempts: u32, base: Duration) -> Self {
    Self {
      max_attempts,
      backoff: Backoff::Exponential(base),
    }
  }

  /// Run `op` until it succeeds, fails with a non-retryable error, or the
  /// attempts are used up. `op` receives the attempt number.
  pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      match op(attempt).await {
        Ok(value) => {
          if attempt > 1 {
            debug!(label, attempt, "Succeeded after retry");
          }
          return Ok(value);
        }
        Err(e) if !e.is_retryable() => return Err(e),
        Err(e) if attempt >= max_attempts => {
          warn!(label, attempts = attempt, error = %e, "Giving up after final attempt");
          return Err(e);
        }
        Err(e) => {
          let delay = self.backoff.delay_for_attempt(attempt);
          debug!(label, attempt, ?delay, error = %e, "Attempt failed, backing off");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }
}

/// Race `fut` against a wall-clock timeout.
///
/// Only the wait is bounded: when `fut` is a handle to spawned work, that
/// work keeps running after the timeout fires.
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T>
where
  Fut: Future<Output = Result<T>>,
{
  tokio::time::timeout(limit, fut)
    .await
    .map_err(|_| DataError::Timeout(limit))?
}
