//! Write batching.
//!
//! ```text
//! batch_operation ──▶ queue ──┬──▶ len == size  → flush now, disarm timer
//!                             └──▶ first enqueue → arm timer (delay)
//!                                                   └─▶ flush on expiry
//! flush: every queued op runs concurrently, each caller gets its own result
//! ```

use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::Backend;
use crate::config::BatchConfig;
use crate::connection::{ConnectionManager, Handle};
use crate::error::{DataError, Result};

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job<B> = Box<dyn FnOnce(Handle<B>) -> JobFuture + Send>;

struct QueueState<B> {
  jobs: Vec<Job<B>>,
  timer: Option<JoinHandle<()>>,
  /// Incremented on every flush so a timer armed for an earlier batch never
  /// flushes a later one.
  epoch: u64,
  closed: bool,
}

/// Queue of pending writes, flushed by size or by timer.
pub(crate) struct BatchQueue<B: Backend> {
  manager: ConnectionManager<B>,
  size: usize,
  delay: Duration,
  state: Arc<Mutex<QueueState<B>>>,
}

impl<B: Backend> BatchQueue<B> {
  pub(crate) fn new(manager: ConnectionManager<B>, config: &BatchConfig) -> Self {
    Self {
      manager,
      size: config.size.max(1),
      delay: Duration::from_millis(config.delay_ms),
      state: Arc::new(Mutex::new(QueueState {
        jobs: Vec::new(),
        timer: None,
        epoch: 0,
        closed: false,
      })),
    }
  }

  /// Enqueue `op` and wait for its own result.
  pub(crate) async fn submit<T, F, Fut>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(Handle<B>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let job: Job<B> = Box::new(move |handle: Handle<B>| -> JobFuture {
      Box::pin(async move {
        let _ = tx.send(op(handle).await);
      })
    });

    let ready = {
      let mut state = self.state.lock();
      if state.closed {
        return Err(DataError::Cancelled);
      }
      state.jobs.push(job);
      if state.jobs.len() >= self.size {
        if let Some(timer) = state.timer.take() {
          timer.abort();
        }
        state.epoch += 1;
        Some(std::mem::take(&mut state.jobs))
      } else {
        if state.timer.is_none() {
          let epoch = state.epoch;
          state.timer = Some(self.arm_timer(epoch));
        }
        None
      }
    };

    if let Some(jobs) = ready {
      spawn_flush(self.manager.clone(), jobs, "size");
    }

    // The sender is dropped without a value if the flush task died or the
    // queue was shut down.
    rx.await.unwrap_or(Err(DataError::Cancelled))
  }

  pub(crate) fn queued(&self) -> usize {
    self.state.lock().jobs.len()
  }

  /// Whether a timer flush is armed.
  pub(crate) fn flush_pending(&self) -> bool {
    self.state.lock().timer.is_some()
  }

  /// Close the queue. Queued jobs are dropped unrun, so their callers see
  /// `Cancelled`; later submissions fail the same way.
  pub(crate) fn shutdown(&self) {
    let dropped = {
      let mut state = self.state.lock();
      state.closed = true;
      state.epoch += 1;
      if let Some(timer) = state.timer.take() {
        timer.abort();
      }
      std::mem::take(&mut state.jobs)
    };
    if !dropped.is_empty() {
      debug!(operations = dropped.len(), "Batch queue closed with pending writes");
    }
  }

  fn arm_timer(&self, epoch: u64) -> JoinHandle<()> {
    let state = Arc::clone(&self.state);
    let manager = self.manager.clone();
    let delay = self.delay;
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let jobs = {
        let mut state = state.lock();
        if state.epoch != epoch {
          return;
        }
        state.epoch += 1;
        state.timer = None;
        std::mem::take(&mut state.jobs)
      };
      if !jobs.is_empty() {
        spawn_flush(manager, jobs, "timer");
      }
    })
  }
}

fn spawn_flush<B: Backend>(manager: ConnectionManager<B>, jobs: Vec<Job<B>>, trigger: &'static str) {
  tokio::spawn(async move {
    let handle = manager.get_handle();
    debug!(operations = jobs.len(), trigger, "Flushing write batch");
    join_all(jobs.into_iter().map(|job| job(handle.clone()))).await;
  });
}
