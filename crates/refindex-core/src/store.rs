//! Storage collaborator traits and their query types.
//!
//! [`RecordStore`] is the content repository: records, child rows and
//! junction tables. [`IndexStore`] persists index rows and the small
//! key/value registry. Backends (e.g. `refindex-store-sqlite`) usually
//! implement both on one connection.
//!
//! All calls are synchronous and may block on I/O.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{entry::ReferenceEntry, record::Record};

// ─── Row selection ───────────────────────────────────────────────────────────

/// Equality filter for [`RecordStore::select_rows`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
  /// At least one pair must match. Empty means unconstrained.
  pub any_of: Vec<(String, Value)>,
  /// Every pair must match.
  pub all_of: Vec<(String, Value)>,
}

// ─── Junction tables ─────────────────────────────────────────────────────────

/// Which end of a junction table a relation is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunctionSide {
  Local,
  Foreign,
}

impl JunctionSide {
  /// Column holding the owner's uid.
  pub fn owner_column(self) -> &'static str {
    match self {
      Self::Local => "uid_local",
      Self::Foreign => "uid_foreign",
    }
  }

  /// Column holding the related uid.
  pub fn other_column(self) -> &'static str {
    match self {
      Self::Local => "uid_foreign",
      Self::Foreign => "uid_local",
    }
  }

  pub fn sort_column(self) -> &'static str {
    match self {
      Self::Local => "sorting",
      Self::Foreign => "sorting_foreign",
    }
  }
}

/// Parameters for [`RecordStore::select_junction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionQuery {
  pub side:         JunctionSide,
  pub owner_uid:    i64,
  pub match_fields: BTreeMap<String, String>,
  /// Restrict to rows with this `tablenames` value.
  pub tablenames:   Option<String>,
  /// The junction table has its own `uid` column; fill [`JunctionRow::uid`].
  pub with_uid:     bool,
}

/// One row of a junction table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JunctionRow {
  /// Own uid, only for junction tables that have one.
  pub uid:             Option<i64>,
  pub uid_local:       i64,
  pub uid_foreign:     i64,
  pub tablenames:      String,
  pub sorting:         i64,
  pub sorting_foreign: i64,
  /// Match and insert columns.
  pub extra:           BTreeMap<String, String>,
}

impl JunctionRow {
  pub fn other_uid(&self, side: JunctionSide) -> i64 {
    match side {
      JunctionSide::Local => self.uid_foreign,
      JunctionSide::Foreign => self.uid_local,
    }
  }

  pub fn sorting_for(&self, side: JunctionSide) -> i64 {
    match side {
      JunctionSide::Local => self.sorting,
      JunctionSide::Foreign => self.sorting_foreign,
    }
  }
}

// ─── Record store ────────────────────────────────────────────────────────────

/// Read and write access to the content repository.
pub trait RecordStore {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Point lookup. Soft-deleted records are returned; only a missing row (or
  /// table) yields `None`.
  fn get_record(&self, table: &str, uid: i64) -> Result<Option<Record>, Self::Error>;

  /// Bulk lookup. Missing uids are skipped; order is unspecified.
  fn get_records(&self, table: &str, uids: &[i64]) -> Result<Vec<Record>, Self::Error>;

  /// Every uid in the table, soft-deleted rows included, ascending.
  fn list_uids(&self, table: &str) -> Result<Vec<i64>, Self::Error>;

  /// Rows matching an equality filter, in uid order.
  fn select_rows(&self, table: &str, filter: &RowFilter) -> Result<Vec<Record>, Self::Error>;

  fn update_fields(
    &self,
    table: &str,
    uid: i64,
    values: &BTreeMap<String, Value>,
  ) -> Result<(), Self::Error>;

  // ── Junction tables ───────────────────────────────────────────────────

  /// Rows owned by `query.owner_uid`, ordered by the side's sort column.
  fn select_junction(
    &self,
    mm: &str,
    query: &JunctionQuery,
  ) -> Result<Vec<JunctionRow>, Self::Error>;

  fn insert_junction(&self, mm: &str, row: &JunctionRow) -> Result<(), Self::Error>;

  /// Set the side's sort column of the row identified by its uid, or by its
  /// `(uid_local, uid_foreign, tablenames, extra)` key when it has none.
  fn update_junction_sorting(
    &self,
    mm: &str,
    row: &JunctionRow,
    side: JunctionSide,
    sorting: i64,
  ) -> Result<(), Self::Error>;

  /// Delete the row identified as for
  /// [`update_junction_sorting`](Self::update_junction_sorting).
  fn delete_junction(&self, mm: &str, row: &JunctionRow) -> Result<(), Self::Error>;

  /// Move every row of `old_uid` on `side` to `new_uid`. Returns the number
  /// of rows changed.
  fn remap_junction(
    &self,
    mm: &str,
    side: JunctionSide,
    old_uid: i64,
    new_uid: i64,
    match_fields: &BTreeMap<String, String>,
  ) -> Result<usize, Self::Error>;
}

// ─── Index store ─────────────────────────────────────────────────────────────

/// Conjunctive filter over index rows; `None` fields are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFilter {
  pub tablename:  Option<String>,
  pub recuid:     Option<i64>,
  pub workspace:  Option<i64>,
  pub ref_table:  Option<String>,
  pub ref_uid:    Option<i64>,
  pub ref_string: Option<String>,
}

impl IndexFilter {
  /// Rows held by one record in one workspace.
  pub fn source(table: &str, uid: i64, workspace: i64) -> Self {
    Self {
      tablename: Some(table.to_owned()),
      recuid: Some(uid),
      workspace: Some(workspace),
      ..Default::default()
    }
  }

  /// Rows pointing at one record.
  pub fn target(table: &str, uid: i64) -> Self {
    Self {
      ref_table: Some(table.to_owned()),
      ref_uid: Some(uid),
      ..Default::default()
    }
  }
}

/// Persistence of index rows plus a durable key/value registry.
pub trait IndexStore {
  type Error: std::error::Error + Send + Sync + 'static;

  fn index_rows(&self, filter: &IndexFilter) -> Result<Vec<ReferenceEntry>, Self::Error>;

  fn index_row(&self, hash: &str) -> Result<Option<ReferenceEntry>, Self::Error>;

  fn insert_index_row(&self, entry: &ReferenceEntry) -> Result<(), Self::Error>;

  /// Move a kept row to its current position.
  fn set_index_sorting(&self, hash: &str, sorting: i64) -> Result<(), Self::Error>;

  /// Returns the number of rows removed.
  fn delete_index_rows(&self, hashes: &[String]) -> Result<usize, Self::Error>;

  /// Distinct `tablename` values present in the index.
  fn index_tables(&self) -> Result<Vec<String>, Self::Error>;

  /// Distinct `recuid` values present for a table.
  fn index_uids(&self, table: &str) -> Result<Vec<i64>, Self::Error>;

  /// Remove a record's rows in every workspace.
  fn delete_index_rows_for_record(&self, table: &str, uid: i64) -> Result<usize, Self::Error>;

  fn delete_index_rows_for_table(&self, table: &str) -> Result<usize, Self::Error>;

  fn registry_get(&self, namespace: &str, key: &str) -> Result<Option<String>, Self::Error>;

  fn registry_set(&self, namespace: &str, key: &str, value: &str) -> Result<(), Self::Error>;
}
