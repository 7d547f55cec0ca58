//! Mutation coordinator: batched writes, ordered multi-step writes and
//! chunked bulk operations.
//!
//! All writes go through the connection manager's handle. None of them are
//! atomic on the server: a transaction here only guarantees order and
//! stop-at-first-failure, not rollback.

mod batch;
mod bulk;

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{Backend, Filter, Row};
use crate::config::BatchConfig;
use crate::connection::{ConnectionManager, ConnectionStats, Handle};
use crate::error::{DataError, Result};
use crate::resilience::RetryPolicy;

use batch::BatchQueue;
pub use bulk::{BulkInsertResult, BulkUpdateResult, ChunkError, RowError, RowUpdate};

pub type OperationFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// One step of a transaction.
pub type Operation<B, T> = Box<dyn FnOnce(Handle<B>) -> OperationFuture<T> + Send>;

/// A declarative write.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  Insert { resource: String, rows: Vec<Row> },
  Update { resource: String, filters: Vec<Filter>, patch: Row },
  Delete { resource: String, filters: Vec<Filter> },
}

impl Mutation {
  pub fn insert(resource: impl Into<String>, rows: Vec<Row>) -> Self {
    Self::Insert {
      resource: resource.into(),
      rows,
    }
  }

  pub fn update(resource: impl Into<String>, filters: Vec<Filter>, patch: Row) -> Self {
    Self::Update {
      resource: resource.into(),
      filters,
      patch,
    }
  }

  pub fn delete(resource: impl Into<String>, filters: Vec<Filter>) -> Self {
    Self::Delete {
      resource: resource.into(),
      filters,
    }
  }

  pub fn resource(&self) -> &str {
    match self {
      Self::Insert { resource, .. } | Self::Update { resource, .. } | Self::Delete { resource, .. } => resource,
    }
  }

  /// Checks that need no network call.
  pub fn validate(&self) -> Result<()> {
    if self.resource().is_empty() {
      return Err(DataError::validation("resource name is empty"));
    }
    match self {
      Self::Insert { rows, .. } if rows.is_empty() => Err(DataError::validation("insert without rows")),
      Self::Insert { rows, .. } if rows.iter().any(|r| !r.is_object()) => {
        Err(DataError::validation("insert rows must be objects"))
      }
      Self::Update { patch, .. } if !patch.as_object().is_some_and(|p| !p.is_empty()) => {
        Err(DataError::validation("update patch must be a non-empty object"))
      }
      // Unfiltered updates and deletes are refused by the backend as well.
      Self::Update { filters, .. } | Self::Delete { filters, .. } if filters.is_empty() => {
        Err(DataError::validation("update and delete require at least one filter"))
      }
      _ => Ok(()),
    }
  }

  /// Validate, then issue the write through `handle`. Returns affected rows.
  pub async fn run<B: Backend>(&self, handle: &Handle<B>) -> Result<Vec<Row>> {
    self.validate()?;
    match self {
      Self::Insert { resource, rows } => handle.insert(resource, rows).await,
      Self::Update {
        resource,
        filters,
        patch,
      } => handle.update(resource, filters, patch).await,
      Self::Delete { resource, filters } => handle.delete(resource, filters).await,
    }
  }

  pub fn into_operation<B: Backend>(self) -> Operation<B, Vec<Row>> {
    Box::new(move |handle: Handle<B>| -> OperationFuture<Vec<Row>> {
      Box::pin(async move { self.run(&handle).await })
    })
  }
}

/// Connection stats plus coordinator-local counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
  #[serde(flatten)]
  pub connection: ConnectionStats,
  pub active_transactions: usize,
  pub queued_operations: usize,
  pub flush_pending: bool,
}

struct Inner<B: Backend> {
  manager: ConnectionManager<B>,
  batch: BatchQueue<B>,
  chunk_size: usize,
  query_retries: u32,
  active_transactions: AtomicUsize,
}

/// Entry point for every write.
pub struct MutationCoordinator<B: Backend> {
  inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for MutationCoordinator<B> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Keeps `active_transactions` accurate even when the caller drops the
/// transaction future midway.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for ActiveGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl<B: Backend> MutationCoordinator<B> {
  pub fn new(manager: ConnectionManager<B>, config: &BatchConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        batch: BatchQueue::new(manager.clone(), config),
        manager,
        chunk_size: config.chunk_size.max(1),
        query_retries: config.query_retries,
        active_transactions: AtomicUsize::new(0),
      }),
    }
  }

  /// Rows per chunk used when the caller has no preference.
  pub fn default_chunk_size(&self) -> usize {
    self.inner.chunk_size
  }

  pub fn default_query_retries(&self) -> u32 {
    self.inner.query_retries
  }

  /// Queue `op` for the next batch flush and wait for its result.
  ///
  /// A failing operation only fails its own caller; siblings in the same
  /// flush are unaffected.
  pub async fn batch_operation<T, F, Fut>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(Handle<B>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.inner.batch.submit(op).await
  }

  /// Queue a declarative write. Invalid mutations fail without being queued.
  pub async fn batch_mutation(&self, mutation: Mutation) -> Result<Vec<Row>> {
    mutation.validate()?;
    self
      .batch_operation(move |handle| async move { mutation.run(&handle).await })
      .await
  }

  /// Run `ops` one after another and stop at the first failure, returning
  /// that error. Steps already applied stay applied.
  pub async fn execute_transaction<T>(&self, ops: Vec<Operation<B, T>>) -> Result<Vec<T>> {
    let _active = ActiveGuard::enter(&self.inner.active_transactions);
    let total = ops.len();
    let mut results = Vec::with_capacity(total);

    for (step, op) in ops.into_iter().enumerate() {
      let handle = self.inner.manager.get_handle();
      match op(handle).await {
        Ok(value) => results.push(value),
        Err(e) => {
          warn!(step, total, error = %e, "Transaction stopped at failing step");
          return Err(e);
        }
      }
    }
    debug!(steps = total, "Transaction completed");
    Ok(results)
  }

  /// Run one read or write with exponential backoff: the wait after attempt
  /// `n` is `2^(n-1)` seconds. `retries` is the total number of attempts.
  /// A rejected session is recovered and the attempt repeated once.
  pub async fn execute_query<T, F, Fut>(&self, query_fn: F, retries: u32) -> Result<T>
  where
    F: Fn(Handle<B>) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    RetryPolicy::exponential(retries, Duration::from_secs(1))
      .run("execute_query", |_| self.inner.manager.with_session_recovery(&query_fn))
      .await
  }

  pub fn get_performance_stats(&self) -> PerformanceStats {
    PerformanceStats {
      connection: self.inner.manager.get_stats(),
      active_transactions: self.inner.active_transactions.load(Ordering::SeqCst),
      queued_operations: self.inner.batch.queued(),
      flush_pending: self.inner.batch.flush_pending(),
    }
  }

  /// Stop batching. Queued operations are cancelled and later ones are
  /// refused.
  pub fn shutdown(&self) {
    self.inner.batch.shutdown();
  }
}
