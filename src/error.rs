//! Error taxonomy for the data access layer.

use std::time::Duration;
use thiserror::Error;

/// PostgREST codes reported when the JWT is expired or its signature is invalid.
const AUTH_ERROR_CODES: &[&str] = &["PGRST301", "PGRST302", "invalid_grant", "bad_jwt"];

pub type Result<T, E = DataError> = std::result::Result<T, E>;

/// Errors produced by the backend client and the layers above it.
///
/// `Clone` so a single failure can be stored in a cache slot and handed to
/// every subscriber of that key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataError {
  /// Missing or malformed configuration. Fatal at startup.
  #[error("configuration error: {0}")]
  Config(String),

  /// Rejected before any network call was made.
  #[error("validation failed: {0}")]
  Validation(String),

  /// Session expired, signature invalid, or credentials rejected.
  #[error("auth error ({code}): {message}")]
  Auth { code: String, message: String },

  /// The service answered with a non-success status.
  #[error("service error {status}{}: {message}", code.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default())]
  Service {
    status: u16,
    code: Option<String>,
    message: String,
  },

  /// Transport-level failure (DNS, connect, reset).
  #[error("network error: {0}")]
  Network(String),

  #[error("timed out after {0:?}")]
  Timeout(Duration),

  /// The operation was aborted, usually because a newer one replaced it.
  #[error("operation was cancelled")]
  Cancelled,

  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl DataError {
  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation(message.into())
  }

  pub fn config(message: impl Into<String>) -> Self {
    Self::Config(message.into())
  }

  /// Whether this failure means the session is no longer valid rather than
  /// the service being unreachable.
  pub fn is_auth_error(&self) -> bool {
    match self {
      Self::Auth { .. } => true,
      Self::Service {
        status,
        code,
        message,
      } => {
        *status == 401
          || code
            .as_deref()
            .is_some_and(|c| AUTH_ERROR_CODES.contains(&c))
          || message.contains("JWT")
      }
      _ => false,
    }
  }

  /// Whether retrying the same call can change the outcome.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Config(_) | Self::Validation(_) | Self::Cancelled => false,
      other => !other.is_auth_error(),
    }
  }
}

impl From<reqwest::Error> for DataError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      Self::Decode(e.to_string())
    } else if let Some(status) = e.status() {
      Self::Service {
        status: status.as_u16(),
        code: None,
        message: e.to_string(),
      }
    } else {
      Self::Network(e.to_string())
    }
  }
}

impl From<serde_json::Error> for DataError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}
