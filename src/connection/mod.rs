//! Connection manager: the single reusable client handle and its session.
//!
//! The manager is constructed once at process start and cloned into the
//! cache engine and mutation coordinator. It:
//! - builds the handle lazily on first use and rebuilds it after a failed
//!   health check
//! - recovers the session at startup and follows auth events
//! - probes the service periodically and refreshes expired sessions
//!
//! None of its connectivity paths return errors. Failures lower the
//! `connected` flag or fall back to anonymous access.

mod handle;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{AuthEvent, Backend, Select, Session};
use crate::config::Config;
use crate::error::Result;

pub use handle::Handle;

type Connector<B> = Box<dyn Fn() -> B + Send + Sync>;

/// Usage statistics for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
  pub reuse_count: u64,
  pub last_activity: Option<DateTime<Utc>>,
  pub connected: bool,
  #[serde(serialize_with = "duration_secs")]
  pub uptime: Duration,
}

/// Outcome of a one-off connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
  pub connected: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

fn duration_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
  s.serialize_f64(d.as_secs_f64())
}

struct State<B> {
  handle: Option<Handle<B>>,
  session: Option<Session>,
  connected: bool,
  reuse_count: u64,
  last_activity: Option<DateTime<Utc>>,
  created_at: Option<Instant>,
  next_handle_id: u64,
  health_task: Option<JoinHandle<()>>,
  auth_task: Option<JoinHandle<()>>,
}

struct Inner<B> {
  connector: Connector<B>,
  probe_resource: String,
  health_interval: Duration,
  state: Mutex<State<B>>,
}

/// Owner of the shared [`Handle`] and the session state around it.
pub struct ConnectionManager<B: Backend> {
  inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for ConnectionManager<B> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<B: Backend> ConnectionManager<B> {
  /// Create a manager. `connector` builds a backend client whenever a handle
  /// has to be (re)constructed; nothing is built until [`Self::get_handle`].
  pub fn new<F>(config: &Config, connector: F) -> Self
  where
    F: Fn() -> B + Send + Sync + 'static,
  {
    Self {
      inner: Arc::new(Inner {
        connector: Box::new(connector),
        probe_resource: config.probe_resource.clone(),
        health_interval: config.health_check_interval(),
        state: Mutex::new(State {
          handle: None,
          session: None,
          connected: false,
          reuse_count: 0,
          last_activity: None,
          created_at: None,
          next_handle_id: 1,
          health_task: None,
          auth_task: None,
        }),
      }),
    }
  }

  /// Return the shared handle, constructing it on first use or after the
  /// previous one was marked disconnected.
  ///
  /// Must be called from within a tokio runtime: construction spawns the
  /// session recovery, auth listener and health-check tasks.
  pub fn get_handle(&self) -> Handle<B> {
    let mut state = self.inner.state.lock();
    state.reuse_count += 1;
    state.last_activity = Some(Utc::now());

    if let Some(handle) = &state.handle {
      if state.connected {
        return handle.clone();
      }
    }

    let id = state.next_handle_id;
    state.next_handle_id += 1;
    let handle = Handle::new(id, (self.inner.connector)());
    state.handle = Some(handle.clone());
    state.connected = true;
    state.created_at = Some(Instant::now());

    if let Some(task) = state.auth_task.take() {
      task.abort();
    }
    state.auth_task = Some(self.spawn_auth_listener(&handle));
    if state.health_task.is_none() {
      state.health_task = Some(self.spawn_health_loop());
    }
    drop(state);

    self.spawn_session_recovery(&handle);
    info!(handle_id = id, "Client handle constructed");
    handle
  }

  /// Current session, if signed in.
  pub fn session(&self) -> Option<Session> {
    self.inner.state.lock().session.clone()
  }

  pub fn get_stats(&self) -> ConnectionStats {
    let state = self.inner.state.lock();
    ConnectionStats {
      reuse_count: state.reuse_count,
      last_activity: state.last_activity,
      connected: state.connected,
      uptime: state
        .created_at
        .map(|t| t.elapsed())
        .unwrap_or_default(),
    }
  }

  /// Probe the service once.
  ///
  /// An auth-class failure still counts as connected: the service answered,
  /// only the session was rejected.
  pub async fn check_connection(&self) -> ConnectionStatus {
    let handle = self.get_handle();
    match self.probe(&handle).await {
      Ok(()) => {
        self.mark_connected();
        ConnectionStatus {
          connected: true,
          error: None,
        }
      }
      Err(e) if e.is_auth_error() => {
        debug!(error = %e, "Probe rejected the session");
        ConnectionStatus {
          connected: true,
          error: None,
        }
      }
      Err(e) => {
        self.inner.state.lock().connected = false;
        ConnectionStatus {
          connected: false,
          error: Some(e.to_string()),
        }
      }
    }
  }

  /// Refresh the session with the stored refresh token, falling back to
  /// anonymous access when that is impossible.
  pub async fn recover_session(&self) {
    let Some(handle) = self.current_handle() else {
      return;
    };
    let refresh_token = self
      .inner
      .state
      .lock()
      .session
      .as_ref()
      .map(|s| s.refresh_token.clone());

    let refreshed = match refresh_token {
      Some(token) => match handle.refresh_session(&token).await {
        Ok(session) => Some(session),
        Err(e) => {
          warn!(error = %e, "Session refresh failed, continuing anonymously");
          None
        }
      },
      None => {
        info!("No refresh token available, continuing anonymously");
        None
      }
    };

    if refreshed.is_none() {
      // Drop the rejected token on the client too, otherwise every request
      // keeps presenting it.
      if let Err(e) = handle.sign_out().await {
        debug!(error = %e, "Local sign-out after failed refresh");
      }
    }

    let mut state = self.inner.state.lock();
    if refreshed.is_some() {
      state.last_activity = Some(Utc::now());
    }
    state.session = refreshed;
    state.connected = true;
  }

  /// Run `call` against the shared handle. When the service rejects the
  /// session, recover it once and run `call` one more time.
  pub async fn with_session_recovery<T, F, Fut>(&self, call: F) -> Result<T>
  where
    F: Fn(Handle<B>) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    match call(self.get_handle()).await {
      Err(e) if e.is_auth_error() => {
        debug!(error = %e, "Call rejected the session, recovering");
        self.recover_session().await;
        call(self.get_handle()).await
      }
      other => other,
    }
  }

  /// Sign in with email and password. Unlike the connectivity paths this
  /// reports rejected credentials to the caller.
  pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
    let handle = self.get_handle();
    let session = handle.sign_in_with_password(email, password).await?;
    self.inner.state.lock().session = Some(session.clone());
    Ok(session)
  }

  /// Sign out. The handle stays usable for anonymous access.
  pub async fn sign_out(&self) {
    if let Some(handle) = self.current_handle() {
      if let Err(e) = handle.sign_out().await {
        warn!(error = %e, "Sign-out failed");
      }
    }
    self.inner.state.lock().session = None;
  }

  /// Tear everything down. Called once at process shutdown.
  pub fn disconnect(&self) {
    let mut state = self.inner.state.lock();
    if let Some(task) = state.health_task.take() {
      task.abort();
    }
    if let Some(task) = state.auth_task.take() {
      task.abort();
    }
    state.session = None;
    state.connected = false;
    state.handle = None;
    state.created_at = None;
    info!("Connection manager disconnected");
  }

  fn current_handle(&self) -> Option<Handle<B>> {
    self.inner.state.lock().handle.clone()
  }

  fn mark_connected(&self) {
    let mut state = self.inner.state.lock();
    state.connected = true;
    state.last_activity = Some(Utc::now());
  }

  async fn probe(&self, handle: &Handle<B>) -> Result<()> {
    let query = Select::from(self.inner.probe_resource.as_str())
      .columns("id")
      .limit(1);
    handle.select(&query).await.map(|_| ())
  }

  async fn health_check(&self) {
    let Some(handle) = self.current_handle() else {
      return;
    };
    match self.probe(&handle).await {
      Ok(()) => self.mark_connected(),
      Err(e) if e.is_auth_error() => {
        debug!(error = %e, "Health check hit an auth error, refreshing session");
        self.recover_session().await;
      }
      Err(e) => {
        warn!(error = %e, "Health check failed");
        self.inner.state.lock().connected = false;
      }
    }
  }

  fn spawn_health_loop(&self) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    let period = self.inner.health_interval;

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        ConnectionManager { inner }.health_check().await;
      }
    })
  }

  fn spawn_auth_listener(&self, handle: &Handle<B>) -> JoinHandle<()> {
    let mut events = handle.auth_events();
    let weak: Weak<Inner<B>> = Arc::downgrade(&self.inner);

    tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) => {
            let Some(inner) = weak.upgrade() else {
              break;
            };
            inner.apply_auth_event(event);
          }
          Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "Auth listener fell behind");
          }
          Err(RecvError::Closed) => break,
        }
      }
    })
  }

  fn spawn_session_recovery(&self, handle: &Handle<B>) {
    let weak = Arc::downgrade(&self.inner);
    let handle = handle.clone();

    tokio::spawn(async move {
      match handle.get_session().await {
        Ok(Some(session)) => {
          if let Some(inner) = weak.upgrade() {
            debug!("Recovered existing session");
            inner.state.lock().session = Some(session);
          }
        }
        Ok(None) => debug!("No existing session, starting anonymously"),
        Err(e) => warn!(error = %e, "Startup session recovery failed"),
      }
    });
  }
}

impl<B> Inner<B> {
  fn apply_auth_event(&self, event: AuthEvent) {
    debug!(event = event.name(), "Auth state changed");
    let mut state = self.state.lock();
    match event {
      AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => {
        state.session = Some(session);
      }
      AuthEvent::InitialSession(session) => state.session = session,
      // The handle stays connected for anonymous access.
      AuthEvent::SignedOut => state.session = None,
    }
  }
}
