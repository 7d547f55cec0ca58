use std::ops::Deref;
use std::sync::Arc;

use crate::backend::Backend;

/// Shared client handle through which every remote call is issued.
///
/// Cloning is cheap and yields the same handle; dereferences to the backend
/// so callers reach rows, auth and storage through one object.
pub struct Handle<B> {
  inner: Arc<HandleInner<B>>,
}

struct HandleInner<B> {
  id: u64,
  backend: B,
}

impl<B: Backend> Handle<B> {
  pub(crate) fn new(id: u64, backend: B) -> Self {
    Self {
      inner: Arc::new(HandleInner { id, backend }),
    }
  }

  /// Identifier that changes whenever the manager rebuilds its handle.
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn backend(&self) -> &B {
    &self.inner.backend
  }
}

impl<B> Clone for Handle<B> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<B> Deref for Handle<B> {
  type Target = B;

  fn deref(&self) -> &B {
    &self.inner.backend
  }
}

impl<B> std::fmt::Debug for Handle<B> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Handle")
      .field("id", &self.inner.id)
      .finish_non_exhaustive()
  }
}
