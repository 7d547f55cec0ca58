//! In-memory [`Backend`] with scripted failures, used by unit tests.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{AuthEvent, Backend, Filter, FilterOp, ObjectInfo, Row, Select, Session};
use crate::error::{DataError, Result};

type InsertHook = Box<dyn Fn(&[Row]) -> Option<DataError> + Send + Sync>;
type UpdateHook = Box<dyn Fn(&Row) -> Option<DataError> + Send + Sync>;

#[derive(Default)]
struct MockState {
  tables: Mutex<HashMap<String, Vec<Row>>>,
  objects: Mutex<HashMap<String, Vec<ObjectInfo>>>,
  select_failures: Mutex<VecDeque<DataError>>,
  insert_hook: Mutex<Option<InsertHook>>,
  update_hook: Mutex<Option<UpdateHook>>,
  session: Mutex<Option<Session>>,
  refresh_result: Mutex<Option<Result<Session>>>,
  session_lookup_fails: Mutex<bool>,
  latency: Mutex<Duration>,
  select_calls: AtomicUsize,
  insert_calls: AtomicUsize,
  update_calls: AtomicUsize,
  refresh_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct MockBackend {
  state: Arc<MockState>,
  events: broadcast::Sender<AuthEvent>,
}

impl Default for MockBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl MockBackend {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      state: Arc::new(MockState::default()),
      events,
    }
  }

  pub fn with_rows(self, resource: &str, rows: Vec<Row>) -> Self {
    self
      .state
      .tables
      .lock()
      .insert(resource.to_string(), rows);
    self
  }

  pub fn rows(&self, resource: &str) -> Vec<Row> {
    self
      .state
      .tables
      .lock()
      .get(resource)
      .cloned()
      .unwrap_or_default()
  }

  /// Queue errors returned by the next `select` calls, in order.
  pub fn fail_selects(&self, errors: impl IntoIterator<Item = DataError>) {
    self.state.select_failures.lock().extend(errors);
  }

  pub fn on_insert(&self, hook: impl Fn(&[Row]) -> Option<DataError> + Send + Sync + 'static) {
    *self.state.insert_hook.lock() = Some(Box::new(hook));
  }

  pub fn on_update(&self, hook: impl Fn(&Row) -> Option<DataError> + Send + Sync + 'static) {
    *self.state.update_hook.lock() = Some(Box::new(hook));
  }

  pub fn set_session(&self, session: Option<Session>) {
    *self.state.session.lock() = session;
  }

  pub fn set_refresh_result(&self, result: Result<Session>) {
    *self.state.refresh_result.lock() = Some(result);
  }

  pub fn fail_session_lookup(&self) {
    *self.state.session_lookup_fails.lock() = true;
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.state.latency.lock() = latency;
  }

  pub fn emit(&self, event: AuthEvent) {
    let _ = self.events.send(event);
  }

  pub fn select_calls(&self) -> usize {
    self.state.select_calls.load(Ordering::SeqCst)
  }

  pub fn insert_calls(&self) -> usize {
    self.state.insert_calls.load(Ordering::SeqCst)
  }

  pub fn update_calls(&self) -> usize {
    self.state.update_calls.load(Ordering::SeqCst)
  }

  pub fn refresh_calls(&self) -> usize {
    self.state.refresh_calls.load(Ordering::SeqCst)
  }

  async fn simulate_latency(&self) {
    let latency = *self.state.latency.lock();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
  }
}

pub fn session(token: &str) -> Session {
  Session {
    access_token: format!("access-{}", token),
    refresh_token: format!("refresh-{}", token),
    expires_at: None,
    user_id: Some("user-1".to_string()),
    email: Some("admin@shop.test".to_string()),
  }
}

fn row_matches(row: &Row, filters: &[Filter]) -> bool {
  filters.iter().all(|f| match f.op {
    FilterOp::Eq => row.get(&f.column) == Some(&f.value),
    FilterOp::Neq => row.get(&f.column) != Some(&f.value),
    _ => true,
  })
}

impl Backend for MockBackend {
  async fn select(&self, query: &Select) -> Result<Vec<Row>> {
    self.state.select_calls.fetch_add(1, Ordering::SeqCst);
    self.simulate_latency().await;
    if let Some(err) = self.state.select_failures.lock().pop_front() {
      return Err(err);
    }
    let rows = self.rows(&query.resource);
    let mut rows: Vec<Row> = rows
      .into_iter()
      .filter(|r| row_matches(r, &query.filters))
      .collect();
    if let Some(range) = query.range {
      rows = rows
        .into_iter()
        .skip(range.offset as usize)
        .take(range.count as usize)
        .collect();
    }
    Ok(rows)
  }

  async fn insert(&self, resource: &str, rows: &[Row]) -> Result<Vec<Row>> {
    self.state.insert_calls.fetch_add(1, Ordering::SeqCst);
    self.simulate_latency().await;
    if let Some(hook) = self.state.insert_hook.lock().as_ref() {
      if let Some(err) = hook(rows) {
        return Err(err);
      }
    }
    self
      .state
      .tables
      .lock()
      .entry(resource.to_string())
      .or_default()
      .extend(rows.iter().cloned());
    Ok(rows.to_vec())
  }

  async fn update(&self, resource: &str, filters: &[Filter], patch: &Row) -> Result<Vec<Row>> {
    self.state.update_calls.fetch_add(1, Ordering::SeqCst);
    self.simulate_latency().await;
    if let Some(hook) = self.state.update_hook.lock().as_ref() {
      if let Some(err) = hook(patch) {
        return Err(err);
      }
    }
    let mut tables = self.state.tables.lock();
    let mut updated = Vec::new();
    if let Some(rows) = tables.get_mut(resource) {
      for row in rows.iter_mut().filter(|r| row_matches(r, filters)) {
        if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
          for (k, v) in fields {
            target.insert(k.clone(), v.clone());
          }
        }
        updated.push(row.clone());
      }
    }
    Ok(updated)
  }

  async fn delete(&self, resource: &str, filters: &[Filter]) -> Result<Vec<Row>> {
    let mut tables = self.state.tables.lock();
    let mut removed = Vec::new();
    if let Some(rows) = tables.get_mut(resource) {
      let (gone, kept): (Vec<Row>, Vec<Row>) =
        rows.drain(..).partition(|r| row_matches(r, filters));
      *rows = kept;
      removed = gone;
    }
    Ok(removed)
  }

  async fn get_session(&self) -> Result<Option<Session>> {
    if *self.state.session_lookup_fails.lock() {
      return Err(DataError::Network("auth endpoint unreachable".into()));
    }
    Ok(self.state.session.lock().clone())
  }

  async fn refresh_session(&self, _refresh_token: &str) -> Result<Session> {
    self.state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let result = self
      .state
      .refresh_result
      .lock()
      .clone()
      .unwrap_or_else(|| Err(DataError::Auth {
        code: "invalid_grant".into(),
        message: "Invalid Refresh Token".into(),
      }));
    if let Ok(session) = &result {
      *self.state.session.lock() = Some(session.clone());
      self.emit(AuthEvent::TokenRefreshed(session.clone()));
    }
    result
  }

  async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
    if password != "correct horse" {
      return Err(DataError::Auth {
        code: "invalid_credentials".into(),
        message: format!("Invalid login credentials for {}", email),
      });
    }
    let s = session("signed-in");
    *self.state.session.lock() = Some(s.clone());
    self.emit(AuthEvent::SignedIn(s.clone()));
    Ok(s)
  }

  async fn sign_out(&self) -> Result<()> {
    *self.state.session.lock() = None;
    self.emit(AuthEvent::SignedOut);
    Ok(())
  }

  fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
    self.events.subscribe()
  }

  async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
    self
      .state
      .objects
      .lock()
      .entry(bucket.to_string())
      .or_default()
      .push(ObjectInfo {
        name: path.to_string(),
        size: Some(bytes.len() as u64),
        updated_at: None,
      });
    Ok(())
  }

  async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
    Ok(
      self
        .state
        .objects
        .lock()
        .get(bucket)
        .map(|objects| {
          objects
            .iter()
            .filter(|o| o.name.starts_with(prefix))
            .cloned()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
    if let Some(objects) = self.state.objects.lock().get_mut(bucket) {
      objects.retain(|o| !paths.contains(&o.name));
    }
    Ok(())
  }
}
