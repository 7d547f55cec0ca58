//! Interface to the remote backend service.
//!
//! The service offers three things this crate relies on:
//! - filterable row access (select/insert/update/delete with filter, sort, range)
//! - an auth subsystem issuing sessions and emitting change events
//! - a bucket-scoped object store (upload, list, remove)
//!
//! [`Backend`] captures that surface so the connection manager, cache and
//! mutation coordinator never depend on a concrete transport.

mod api_types;
#[cfg(test)]
pub(crate) mod mock;
mod rest;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tokio::sync::broadcast;

use crate::error::{DataError, Result};

pub use rest::RestBackend;

/// A row as returned by the service.
pub type Row = Value;

/// Comparison operators understood by the row API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
  Eq,
  Neq,
  Gt,
  Gte,
  Lt,
  Lte,
  Like,
  Ilike,
  In,
  Is,
}

impl FilterOp {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Eq => "eq",
      Self::Neq => "neq",
      Self::Gt => "gt",
      Self::Gte => "gte",
      Self::Lt => "lt",
      Self::Lte => "lte",
      Self::Like => "like",
      Self::Ilike => "ilike",
      Self::In => "in",
      Self::Is => "is",
    }
  }
}

impl std::str::FromStr for FilterOp {
  type Err = DataError;

  fn from_str(s: &str) -> Result<Self> {
    const ALL: [FilterOp; 10] = [
      FilterOp::Eq,
      FilterOp::Neq,
      FilterOp::Gt,
      FilterOp::Gte,
      FilterOp::Lt,
      FilterOp::Lte,
      FilterOp::Like,
      FilterOp::Ilike,
      FilterOp::In,
      FilterOp::Is,
    ];
    ALL
      .into_iter()
      .find(|op| op.as_str() == s)
      .ok_or_else(|| DataError::validation(format!("unknown filter operator: {}", s)))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub column: String,
  pub op: FilterOp,
  pub value: Value,
}

impl Filter {
  pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
    Self {
      column: column.into(),
      op,
      value: value.into(),
    }
  }

  pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(column, FilterOp::Eq, value)
  }

  /// Render as the `op.value` form used in query strings.
  pub fn encode_value(&self) -> String {
    match (&self.op, &self.value) {
      (FilterOp::In, Value::Array(items)) => {
        let items: Vec<String> = items.iter().map(scalar_to_string).collect();
        format!("in.({})", items.join(","))
      }
      (op, value) => format!("{}.{}", op.as_str(), scalar_to_string(value)),
    }
  }
}

/// Parses the query-string form `column=op.value`, e.g. `price=lt.100` or
/// `id=in.(1,2,3)`. Values that parse as JSON scalars keep their type.
impl std::str::FromStr for Filter {
  type Err = DataError;

  fn from_str(s: &str) -> Result<Self> {
    let invalid = || DataError::validation(format!("expected column=op.value, got: {}", s));
    let (column, rest) = s.split_once('=').ok_or_else(invalid)?;
    let (op, raw) = rest.split_once('.').ok_or_else(invalid)?;
    if column.is_empty() {
      return Err(invalid());
    }
    let op: FilterOp = op.parse()?;

    let value = match (op, raw.strip_prefix('(').and_then(|r| r.strip_suffix(')'))) {
      (FilterOp::In, Some(list)) => Value::Array(list.split(',').map(|v| parse_scalar(v.trim())).collect()),
      _ => parse_scalar(raw),
    };
    Ok(Self::new(column, op, value))
  }
}

fn parse_scalar(raw: &str) -> Value {
  match serde_json::from_str::<Value>(raw) {
    Ok(v) if !v.is_object() && !v.is_array() => v,
    _ => Value::String(raw.to_string()),
  }
}

fn scalar_to_string(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
  pub column: String,
  pub ascending: bool,
}

/// Window of rows: skip `offset`, return at most `count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
  pub offset: u64,
  pub count: u64,
}

impl Range {
  /// Rows `from..=to`, zero-based. Empty when `to < from`.
  pub fn inclusive(from: u64, to: u64) -> Self {
    Self {
      offset: from,
      count: (to + 1).saturating_sub(from),
    }
  }
}

/// A read against one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
  pub resource: String,
  pub columns: String,
  pub filters: Vec<Filter>,
  pub sort: Vec<Sort>,
  pub range: Option<Range>,
}

impl Select {
  pub fn from(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      columns: "*".to_string(),
      filters: Vec::new(),
      sort: Vec::new(),
      range: None,
    }
  }

  pub fn columns(mut self, columns: impl Into<String>) -> Self {
    self.columns = columns.into();
    self
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter(Filter::eq(column, value))
  }

  pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
    self.sort.push(Sort {
      column: column.into(),
      ascending,
    });
    self
  }

  /// Rows `from..=to`, zero-based.
  pub fn range(mut self, from: u64, to: u64) -> Self {
    self.range = Some(Range::inclusive(from, to));
    self
  }

  /// At most `count` rows; `limit(0)` selects none.
  pub fn limit(mut self, count: u64) -> Self {
    self.range = Some(Range { offset: 0, count });
    self
  }
}

/// Authenticated session issued by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
  pub access_token: String,
  pub refresh_token: String,
  pub expires_at: Option<DateTime<Utc>>,
  pub user_id: Option<String>,
  pub email: Option<String>,
}

impl Session {
  pub fn is_expired(&self) -> bool {
    self.expires_at.is_some_and(|at| at <= Utc::now())
  }
}

/// Session change notifications emitted by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
  SignedIn(Session),
  SignedOut,
  TokenRefreshed(Session),
  InitialSession(Option<Session>),
}

impl AuthEvent {
  pub fn name(&self) -> &'static str {
    match self {
      Self::SignedIn(_) => "SIGNED_IN",
      Self::SignedOut => "SIGNED_OUT",
      Self::TokenRefreshed(_) => "TOKEN_REFRESHED",
      Self::InitialSession(_) => "INITIAL_SESSION",
    }
  }
}

/// Metadata for an object in a storage bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
  pub name: String,
  pub size: Option<u64>,
  pub updated_at: Option<String>,
}

/// Operations the remote service provides.
pub trait Backend: Send + Sync + 'static {
  fn select(&self, query: &Select) -> impl Future<Output = Result<Vec<Row>>> + Send;

  fn insert(&self, resource: &str, rows: &[Row]) -> impl Future<Output = Result<Vec<Row>>> + Send;

  fn update(
    &self,
    resource: &str,
    filters: &[Filter],
    patch: &Row,
  ) -> impl Future<Output = Result<Vec<Row>>> + Send;

  fn delete(
    &self,
    resource: &str,
    filters: &[Filter],
  ) -> impl Future<Output = Result<Vec<Row>>> + Send;

  /// Current session as known to the auth subsystem.
  fn get_session(&self) -> impl Future<Output = Result<Option<Session>>> + Send;

  fn refresh_session(&self, refresh_token: &str) -> impl Future<Output = Result<Session>> + Send;

  fn sign_in_with_password(
    &self,
    email: &str,
    password: &str,
  ) -> impl Future<Output = Result<Session>> + Send;

  fn sign_out(&self) -> impl Future<Output = Result<()>> + Send;

  /// Subscribe to session change notifications.
  fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;

  fn upload(
    &self,
    bucket: &str,
    path: &str,
    bytes: Vec<u8>,
    content_type: &str,
  ) -> impl Future<Output = Result<()>> + Send;

  fn list(&self, bucket: &str, prefix: &str)
    -> impl Future<Output = Result<Vec<ObjectInfo>>> + Send;

  fn remove(&self, bucket: &str, paths: &[String]) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_filter_encoding() {
    assert_eq!(Filter::eq("category", "shoes").encode_value(), "eq.shoes");
    assert_eq!(
      Filter::new("price", FilterOp::Gte, 10).encode_value(),
      "gte.10"
    );
    assert_eq!(
      Filter::new("id", FilterOp::In, json!([1, 2, 3])).encode_value(),
      "in.(1,2,3)"
    );
    assert_eq!(
      Filter::new("deleted_at", FilterOp::Is, Value::Null).encode_value(),
      "is.null"
    );
  }

  #[test]
  fn test_select_builder() {
    let q = Select::from("products")
      .columns("id,name")
      .eq("active", true)
      .order("created_at", false)
      .limit(20);
    assert_eq!(q.columns, "id,name");
    assert_eq!(q.filters.len(), 1);
    assert_eq!(q.range, Some(Range { offset: 0, count: 20 }));

    let page = Select::from("products").range(20, 39);
    assert_eq!(page.range, Some(Range { offset: 20, count: 20 }));
  }

  #[test]
  fn test_zero_limit_selects_nothing() {
    let q = Select::from("products").limit(0);
    assert_eq!(q.range, Some(Range { offset: 0, count: 0 }));
    assert_eq!(Range::inclusive(5, 4).count, 0);
  }

  #[test]
  fn test_filter_parse() {
    let f: Filter = "category=eq.shoes".parse().unwrap();
    assert_eq!(f, Filter::eq("category", "shoes"));

    let f: Filter = "price=lt.100".parse().unwrap();
    assert_eq!(f, Filter::new("price", FilterOp::Lt, 100));

    let f: Filter = "id=in.(1, 2,abc)".parse().unwrap();
    assert_eq!(f.value, json!([1, 2, "abc"]));

    let f: Filter = "deleted_at=is.null".parse().unwrap();
    assert_eq!(f.value, Value::Null);

    assert!("category".parse::<Filter>().is_err());
    assert!("=eq.x".parse::<Filter>().is_err());
    assert!(matches!("price=about.3".parse::<Filter>(), Err(DataError::Validation(_))));
  }
}
