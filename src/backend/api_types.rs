//! Serde-deserializable types matching the service's HTTP responses.
//!
//! These are kept apart from the domain types in [`super`] so the wire
//! format can change without touching callers.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{ObjectInfo, Session};
use crate::error::DataError;

// ============================================================================
// Errors
// ============================================================================

/// Error body. The row API uses `code`/`message`, the auth API uses
/// `error`/`error_description` or `msg`.
#[derive(Debug, Default, Deserialize)]
pub struct ApiError {
  pub code: Option<serde_json::Value>,
  pub message: Option<String>,
  pub error: Option<String>,
  pub error_description: Option<String>,
  pub msg: Option<String>,
  pub error_code: Option<String>,
}

impl ApiError {
  /// Build a [`DataError`] from a failed response.
  pub fn into_error(self, status: u16) -> DataError {
    let code = self
      .error_code
      .or_else(|| {
        self.code.map(|c| match c {
          serde_json::Value::String(s) => s,
          other => other.to_string(),
        })
      })
      .or_else(|| self.error.clone());
    let message = self
      .message
      .or(self.error_description)
      .or(self.msg)
      .or(self.error)
      .unwrap_or_else(|| format!("HTTP {}", status));

    if status == 401 || (status == 403 && message.contains("JWT")) {
      DataError::Auth {
        code: code.unwrap_or_else(|| status.to_string()),
        message,
      }
    } else {
      DataError::Service {
        status,
        code,
        message,
      }
    }
  }
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  pub id: String,
  pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiTokenResponse {
  pub access_token: String,
  pub refresh_token: String,
  /// Seconds since epoch
  pub expires_at: Option<i64>,
  /// Seconds from now, used when `expires_at` is absent
  pub expires_in: Option<i64>,
  pub user: Option<ApiUser>,
}

impl ApiTokenResponse {
  pub fn into_session(self) -> Session {
    let expires_at = self
      .expires_at
      .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
      .or_else(|| {
        self
          .expires_in
          .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
      });
    let (user_id, email) = match self.user {
      Some(user) => (Some(user.id), user.email),
      None => (None, None),
    };
    Session {
      access_token: self.access_token,
      refresh_token: self.refresh_token,
      expires_at,
      user_id,
      email,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct RefreshTokenRequest<'a> {
  pub refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
pub struct PasswordRequest<'a> {
  pub email: &'a str,
  pub password: &'a str,
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ListObjectsRequest<'a> {
  pub prefix: &'a str,
  pub limit: u32,
  pub offset: u32,
}

#[derive(Debug, Serialize)]
pub struct RemoveObjectsRequest<'a> {
  pub prefixes: &'a [String],
}

#[derive(Debug, Deserialize)]
pub struct ApiObjectMetadata {
  pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApiObject {
  pub name: String,
  pub updated_at: Option<String>,
  pub metadata: Option<ApiObjectMetadata>,
}

impl From<ApiObject> for ObjectInfo {
  fn from(o: ApiObject) -> Self {
    ObjectInfo {
      name: o.name,
      size: o.metadata.and_then(|m| m.size),
      updated_at: o.updated_at,
    }
  }
}
