//! Structured cache keys.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backend::{Filter, FilterOp, Range, Select, Sort};

/// Identity of a cached read: which resource, which rows, in which order.
///
/// Filters and selected columns are normalized before hashing, so two keys
/// that differ only in filter order share a cache entry. Sort order is
/// significant and kept as given.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryKey {
  pub resource: String,
  pub columns: String,
  pub filters: Vec<Filter>,
  pub sort: Vec<Sort>,
  pub pagination: Option<Range>,
}

impl QueryKey {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      columns: "*".to_string(),
      filters: Vec::new(),
      sort: Vec::new(),
      pagination: None,
    }
  }

  pub fn with_filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn with_sort(mut self, column: impl Into<String>, ascending: bool) -> Self {
    self.sort.push(Sort {
      column: column.into(),
      ascending,
    });
    self
  }

  pub fn with_pagination(mut self, from: u64, to: u64) -> Self {
    self.pagination = Some(Range::inclusive(from, to));
    self
  }

  /// Stable, fixed-length key for the cache map.
  ///
  /// Hashes the JSON encoding of the normalized structure, so filter values
  /// containing `&` or `=` cannot alias a different set of filters.
  pub fn cache_hash(&self) -> String {
    let mut filters: Vec<(&str, FilterOp, &Value)> = self
      .filters
      .iter()
      .map(|f| (f.column.as_str(), f.op, &f.value))
      .collect();
    filters.sort_by(|a, b| {
      (a.0, a.1)
        .cmp(&(b.0, b.1))
        .then_with(|| a.2.to_string().cmp(&b.2.to_string()))
    });

    let canonical = (
      &self.resource,
      self.normalized_columns(),
      filters,
      &self.sort,
      self.pagination,
    );
    // Plain data with string keys; serializing it cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
  }

  fn normalized_columns(&self) -> Vec<&str> {
    let mut columns: Vec<&str> = self
      .columns
      .split(',')
      .map(str::trim)
      .filter(|c| !c.is_empty())
      .collect();
    columns.sort_unstable();
    columns.dedup();
    columns
  }

  /// Canonical human-readable form, for logs.
  pub fn description(&self) -> String {
    let columns = self.normalized_columns();

    let mut filters: Vec<String> = self
      .filters
      .iter()
      .map(|f| format!("{}={}", f.column, f.encode_value()))
      .collect();
    filters.sort();

    let sort: Vec<String> = self
      .sort
      .iter()
      .map(|s| format!("{}.{}", s.column, if s.ascending { "asc" } else { "desc" }))
      .collect();

    let mut out = format!("{}?select={}", self.resource, columns.join(","));
    if !filters.is_empty() {
      out.push('&');
      out.push_str(&filters.join("&"));
    }
    if !sort.is_empty() {
      out.push_str("&order=");
      out.push_str(&sort.join(","));
    }
    if let Some(range) = self.pagination {
      out.push_str(&format!("&offset={}&limit={}", range.offset, range.count));
    }
    out
  }
}

impl From<&Select> for QueryKey {
  fn from(query: &Select) -> Self {
    Self {
      resource: query.resource.clone(),
      columns: query.columns.clone(),
      filters: query.filters.clone(),
      sort: query.sort.clone(),
      pagination: query.range,
    }
  }
}
