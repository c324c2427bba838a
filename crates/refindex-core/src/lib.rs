//! Core types, collaborator traits and algorithms for the reference index.
//!
//! The reference index is a derived side table listing every outgoing
//! reference held by any record of a relational content repository: record
//! relations, file references and soft references found inside text. This
//! crate resolves relations, computes fingerprinted index entries and keeps
//! the persisted index in sync through the [`store`] traits.
//!
//! This crate is deliberately free of database dependencies; backends such as
//! `refindex-store-sqlite` implement [`store::RecordStore`] and
//! [`store::IndexStore`].

pub mod entry;
pub mod error;
pub mod extract;
pub mod index;
pub mod record;
pub mod relation;
pub mod rewrite;
pub mod schema;
pub mod softref;
pub mod store;
pub mod tree;

pub use error::{Error, Result};
pub use index::{ReconcileReport, ReferenceIndex, UpdateResult};
pub use schema::Schema;
