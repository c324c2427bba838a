//! Index entries and the pure builder that produces them.
//!
//! An entry's `hash` is a SHA-256 fingerprint over the occurrence columns
//! plus [`INDEX_VERSION`]. Entries are compared by fingerprint only, so a
//! change in any of those columns is a delete of the old row and an insert of
//! the new one.
//!
//! `sorting` is not part of the fingerprint: an occurrence that only moved
//! within its field keeps its row, and the index refreshes the stored
//! position in place. Repeated targets at one location are told apart by
//! their `occurrence` ordinal instead.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::schema::Schema;

/// Bumped whenever the meaning of an index column changes; every stored
/// fingerprint then becomes stale and is rebuilt by reconciliation.
pub const INDEX_VERSION: u32 = 2;

/// Pseudo-table for file targets; the path is in `ref_string`.
pub const FILE_TABLE: &str = "_FILE";
/// Pseudo-table for literal token targets; the value is in `ref_string`.
pub const STRING_TABLE: &str = "_STRING";

// ─── Entry ───────────────────────────────────────────────────────────────────

/// One row of the reference index: a directed edge from a field location to
/// a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
  pub hash:        String,
  pub tablename:   String,
  pub recuid:      i64,
  pub field:       String,
  /// Tree path inside a nested field; empty for flat fields.
  pub flexpointer: String,
  pub softref_key: String,
  pub softref_id:  String,
  /// Position among the field's relations; -1 when unordered.
  pub sorting:     i64,
  /// Ordinal among identical targets at the same location, from 0.
  pub occurrence:  i64,
  pub deleted:     bool,
  pub workspace:   i64,
  pub ref_table:   String,
  pub ref_uid:     i64,
  pub ref_string:  String,
}

impl ReferenceEntry {
  pub fn is_soft_reference(&self) -> bool { !self.softref_key.is_empty() }

  pub fn target(&self) -> RefTarget {
    match self.ref_table.as_str() {
      FILE_TABLE => RefTarget::File { path: self.ref_string.clone() },
      STRING_TABLE => RefTarget::Literal { value: self.ref_string.clone() },
      _ => RefTarget::Record { table: self.ref_table.clone(), uid: self.ref_uid },
    }
  }

  /// Recompute the fingerprint from the occurrence columns.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    let mut put = |s: &str| {
      hasher.update(s.as_bytes());
      hasher.update([0x1f]);
    };
    put(&INDEX_VERSION.to_string());
    put(&self.tablename);
    put(&self.recuid.to_string());
    put(&self.field);
    put(&self.flexpointer);
    put(&self.softref_key);
    put(&self.softref_id);
    put(&self.occurrence.to_string());
    put(if self.deleted { "1" } else { "0" });
    put(&self.workspace.to_string());
    put(&self.ref_table);
    put(&self.ref_uid.to_string());
    put(&self.ref_string);
    hex::encode(hasher.finalize())
  }
}

// ─── Builder inputs ──────────────────────────────────────────────────────────

/// What an occurrence points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefTarget {
  Record { table: String, uid: i64 },
  File { path: String },
  Literal { value: String },
}

/// Where an occurrence lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source<'a> {
  pub table:     &'a str,
  pub uid:       i64,
  pub field:     &'a str,
  pub path:      &'a str,
  pub deleted:   bool,
  /// The source record's own workspace.
  pub workspace: i64,
}

/// Recognizer key and match id of a soft reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftRefCoords<'a> {
  pub key: &'a str,
  pub id:  &'a str,
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Normalizes resolved relations into [`ReferenceEntry`] rows for one
/// configured workspace.
#[derive(Debug, Clone, Copy)]
pub struct EntryBuilder<'a> {
  schema:    &'a Schema,
  workspace: i64,
}

impl<'a> EntryBuilder<'a> {
  pub fn new(schema: &'a Schema, workspace: i64) -> Self { Self { schema, workspace } }

  /// Build one entry, or `None` when the source row belongs to another
  /// workspace of a versioned table.
  pub fn build(
    &self,
    source: &Source<'_>,
    target: &RefTarget,
    sorting: i64,
    occurrence: i64,
    softref: Option<SoftRefCoords<'_>>,
  ) -> Option<ReferenceEntry> {
    let versioned = self
      .schema
      .table(source.table)
      .is_some_and(|t| t.versioning);
    if versioned && source.workspace != self.workspace {
      return None;
    }

    let (ref_table, ref_uid, ref_string) = match target {
      RefTarget::Record { table, uid } => (table.clone(), *uid, String::new()),
      RefTarget::File { path } => (FILE_TABLE.to_owned(), 0, path.clone()),
      RefTarget::Literal { value } => (STRING_TABLE.to_owned(), 0, value.clone()),
    };

    let mut entry = ReferenceEntry {
      hash: String::new(),
      tablename: source.table.to_owned(),
      recuid: source.uid,
      field: source.field.to_owned(),
      flexpointer: source.path.to_owned(),
      softref_key: softref.map(|s| s.key.to_owned()).unwrap_or_default(),
      softref_id: softref.map(|s| s.id.to_owned()).unwrap_or_default(),
      sorting,
      occurrence,
      deleted: source.deleted,
      workspace: self.workspace,
      ref_table,
      ref_uid,
      ref_string,
    };
    entry.hash = entry.fingerprint();
    Some(entry)
  }
}
