//! Records as the storage layer hands them to the core.
//!
//! A record is a loosely typed column map. Relation fields, file lists and
//! soft-reference text are all read through [`Record::text`]; ids and flags
//! through [`Record::int`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, FromRepr};

use crate::schema::TableSchema;

/// Primary-key column of every content table.
pub const UID_FIELD: &str = "uid";
/// Workspace a versioned row belongs to (0 = live).
pub const WS_ID_FIELD: &str = "ws_id";
/// For a workspace version, the uid of the live record it versions.
pub const WS_ORIGIN_FIELD: &str = "ws_origin";
/// Raw [`VersionState`] of a versioned row.
pub const WS_STATE_FIELD: &str = "ws_state";

// ─── Record ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub table:  String,
  pub uid:    i64,
  pub fields: BTreeMap<String, Value>,
}

impl Record {
  pub fn new(table: impl Into<String>, uid: i64) -> Self {
    Self { table: table.into(), uid, fields: BTreeMap::new() }
  }

  /// Builder-style field setter, mostly for tests and imports.
  pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.fields.insert(field.into(), value.into());
    self
  }

  pub fn get(&self, field: &str) -> Option<&Value> { self.fields.get(field) }

  /// The column rendered as text. Missing and NULL columns are empty.
  pub fn text(&self, field: &str) -> String {
    match self.fields.get(field) {
      None | Some(Value::Null) => String::new(),
      Some(Value::String(s)) => s.clone(),
      Some(Value::Bool(b)) => String::from(if *b { "1" } else { "0" }),
      Some(other) => other.to_string(),
    }
  }

  /// The column read as an integer; anything unparsable is 0.
  pub fn int(&self, field: &str) -> i64 {
    match self.fields.get(field) {
      Some(Value::Number(n)) => n
        .as_i64()
        .or_else(|| n.as_f64().map(|f| f as i64))
        .unwrap_or(0),
      Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
      Some(Value::Bool(b)) => i64::from(*b),
      _ => 0,
    }
  }

  /// Whether the record is soft-deleted according to its table schema.
  pub fn is_deleted(&self, table: &TableSchema) -> bool {
    table
      .delete_field
      .as_deref()
      .is_some_and(|f| self.int(f) != 0)
  }

  /// The workspace the row itself lives in. Always 0 for unversioned tables.
  pub fn workspace(&self) -> i64 { self.int(WS_ID_FIELD) }

  pub fn version_info(&self) -> VersionInfo {
    VersionInfo {
      uid:       self.uid,
      workspace: self.int(WS_ID_FIELD),
      live_uid:  self.int(WS_ORIGIN_FIELD),
      state:     VersionState::from_repr(self.int(WS_STATE_FIELD)).unwrap_or_default(),
    }
  }
}

// ─── Versioning ──────────────────────────────────────────────────────────────

/// What a workspace row stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(i64)]
pub enum VersionState {
  #[default]
  Default           = 0,
  NewPlaceholder    = 1,
  DeletePlaceholder = 2,
  MovePointer       = 4,
}

/// Version metadata of one row, as needed by the purge strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
  pub uid:       i64,
  pub workspace: i64,
  /// Uid of the live record this row versions; 0 for live rows.
  pub live_uid:  i64,
  pub state:     VersionState,
}

impl VersionInfo {
  pub fn is_version(&self) -> bool { self.workspace != 0 }
}
