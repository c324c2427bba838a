//! SQLite backend for the reference index.
//!
//! One [`SqliteStore`] holds both the content repository (records and
//! junction tables) and the index itself, so it implements both
//! [`RecordStore`](refindex_core::store::RecordStore) and
//! [`IndexStore`](refindex_core::store::IndexStore).

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
