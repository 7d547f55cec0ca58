//! Chunked bulk writes that tolerate partial failure.

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::MutationCoordinator;
use crate::backend::{Backend, Filter, Row};
use crate::error::{DataError, Result};

/// A failed insert chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkError {
  /// 0-indexed chunk position
  pub chunk: usize,
  /// Rows in the chunk, none of which were inserted
  pub rows: usize,
  pub error: DataError,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkInsertResult {
  pub success: bool,
  pub inserted_count: usize,
  pub errors: Vec<ChunkError>,
}

/// Patch for the row whose `key_column` equals `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
  pub key_column: String,
  pub key: Value,
  pub patch: Row,
}

impl RowUpdate {
  pub fn new(key_column: impl Into<String>, key: impl Into<Value>, patch: Row) -> Self {
    Self {
      key_column: key_column.into(),
      key: key.into(),
      patch,
    }
  }

  /// Update keyed on the `id` column.
  pub fn by_id(id: impl Into<Value>, patch: Row) -> Self {
    Self::new("id", id, patch)
  }
}

/// A failed row update.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
  /// Position of the update in the caller's list
  pub index: usize,
  pub key: Value,
  pub error: DataError,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkUpdateResult {
  pub success: bool,
  pub updated_count: usize,
  pub errors: Vec<RowError>,
}

fn validate_target(resource: &str, chunk_size: usize) -> Result<()> {
  if resource.is_empty() {
    return Err(DataError::validation("resource name is empty"));
  }
  if chunk_size == 0 {
    return Err(DataError::validation("chunk size must be at least 1"));
  }
  Ok(())
}

impl<B: Backend> MutationCoordinator<B> {
  /// Insert `rows` in chunks of `chunk_size`, one chunk at a time.
  ///
  /// A failing chunk is recorded and skipped; the remaining chunks still
  /// run. Only invalid arguments produce an `Err`, and they do so before
  /// anything is sent.
  pub async fn bulk_insert(&self, resource: &str, rows: Vec<Row>, chunk_size: usize) -> Result<BulkInsertResult> {
    validate_target(resource, chunk_size)?;
    if let Some(position) = rows.iter().position(|r| !r.is_object()) {
      return Err(DataError::validation(format!("row {} is not an object", position)));
    }

    let chunks = rows.len().div_ceil(chunk_size);
    info!(resource, rows = rows.len(), chunks, "Bulk insert started");

    let mut result = BulkInsertResult::default();
    for (index, chunk) in rows.chunks(chunk_size).enumerate() {
      let handle = self.inner.manager.get_handle();
      match handle.insert(resource, chunk).await {
        Ok(_) => {
          result.inserted_count += chunk.len();
          debug!(resource, chunk = index, rows = chunk.len(), "Chunk inserted");
        }
        Err(error) => {
          warn!(resource, chunk = index, rows = chunk.len(), error = %error, "Chunk insert failed");
          result.errors.push(ChunkError {
            chunk: index,
            rows: chunk.len(),
            error,
          });
        }
      }
    }

    result.success = result.errors.is_empty();
    info!(
      resource,
      inserted = result.inserted_count,
      failed_chunks = result.errors.len(),
      "Bulk insert finished"
    );
    Ok(result)
  }

  /// Apply `updates` in chunks of `chunk_size`. Rows within a chunk are
  /// updated concurrently; chunks run one after another. Every failed row is
  /// recorded without affecting the others.
  pub async fn bulk_update(
    &self,
    resource: &str,
    updates: Vec<RowUpdate>,
    chunk_size: usize,
  ) -> Result<BulkUpdateResult> {
    validate_target(resource, chunk_size)?;
    info!(resource, rows = updates.len(), "Bulk update started");

    let mut result = BulkUpdateResult::default();
    for (chunk_index, chunk) in updates.chunks(chunk_size).enumerate() {
      let handle = self.inner.manager.get_handle();
      let base = chunk_index * chunk_size;

      let outcomes = join_all(chunk.iter().enumerate().map(|(offset, update)| {
        let handle = handle.clone();
        async move {
          let outcome = match update.patch.as_object() {
            Some(fields) if !fields.is_empty() => {
              let filters = [Filter::eq(update.key_column.as_str(), update.key.clone())];
              handle.update(resource, &filters, &update.patch).await.map(|_| ())
            }
            _ => Err(DataError::validation("patch must be a non-empty object")),
          };
          (base + offset, update, outcome)
        }
      }))
      .await;

      for (index, update, outcome) in outcomes {
        match outcome {
          Ok(()) => result.updated_count += 1,
          Err(error) => {
            warn!(resource, index, key = %update.key, error = %error, "Row update failed");
            result.errors.push(RowError {
              index,
              key: update.key.clone(),
              error,
            });
          }
        }
      }
    }

    result.success = result.errors.is_empty();
    info!(
      resource,
      updated = result.updated_count,
      failed = result.errors.len(),
      "Bulk update finished"
    );
    Ok(result)
  }
}
