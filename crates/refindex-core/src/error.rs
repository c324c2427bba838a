//! Error types for `refindex-core`.
//!
//! Only collaborator failures are errors. Malformed relation metadata and
//! data drift degrade to partial results or [`Refusal`](crate::rewrite::Refusal)
//! values instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("storage error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Wrap a backend error. Used as `.map_err(Error::store)` at every
  /// collaborator call site.
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
