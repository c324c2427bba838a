//! The relation handler: turns one field's raw relation descriptor into an
//! ordered list of `(table, uid)` pairs, and writes such lists back.
//!
//! A handler is created per field of a record and populated once via
//! [`RelationHandler::start`]. Depending on the field configuration the
//! pairs come from a comma-separated list ([`list`]), a junction table
//! ([`mm`]) or child rows pointing at the owner ([`foreign`]). Workspace
//! purging lives in [`purge`].
//!
//! Misconfiguration never fails: unknown tables are dropped and a field with
//! no usable table simply resolves to nothing. Only storage errors surface.

pub mod foreign;
pub mod list;
pub mod mm;
pub mod purge;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  record::Record,
  schema::{RelationConfig, Schema},
  store::{JunctionSide, RecordStore},
};

pub use list::{ParsedList, parse_list};
pub use mm::MmWriteReport;
pub use purge::PurgeStrategy;

// ─── Items ───────────────────────────────────────────────────────────────────

/// One resolved relation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationItem {
  pub table: String,
  pub uid:   i64,
}

impl RelationItem {
  pub fn new(table: impl Into<String>, uid: i64) -> Self { Self { table: table.into(), uid } }
}

/// Collaborator that recomputes one record's index rows. Implemented by
/// [`ReferenceIndex`](crate::index::ReferenceIndex).
pub trait ReindexHook {
  fn reindex(&self, table: &str, uid: i64) -> Result<()>;
}

// ─── Junction configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MmState {
  table:          String,
  side:           JunctionSide,
  match_fields:   BTreeMap<String, String>,
  insert_fields:  BTreeMap<String, String>,
  has_uid:        bool,
  /// Local side: rows carry the target table name.
  tablenames:     bool,
  /// Foreign side: the opposite field allows several tables, so rows are
  /// scoped by `tablenames = owner table`.
  opposite_multi: bool,
}

// ─── Handler ─────────────────────────────────────────────────────────────────

/// Working state for one relation field. Not to be reused across fields
/// without calling [`start`](Self::start) again.
pub struct RelationHandler<'a, S> {
  store:           &'a S,
  schema:          &'a Schema,
  workspace:       i64,
  include_delete_placeholders: bool,

  config:          RelationConfig,
  tables:          Vec<String>,
  mm:              Option<MmState>,

  table_array:     BTreeMap<String, Vec<i64>>,
  item_array:      Vec<RelationItem>,
  non_table_array: Vec<String>,
  purged:          bool,
}

impl<'a, S: RecordStore> RelationHandler<'a, S> {
  pub fn new(store: &'a S, schema: &'a Schema) -> Self {
    Self {
      store,
      schema,
      workspace: 0,
      include_delete_placeholders: false,
      config: RelationConfig::default(),
      tables: Vec::new(),
      mm: None,
      table_array: BTreeMap::new(),
      item_array: Vec::new(),
      non_table_array: Vec::new(),
      purged: false,
    }
  }

  /// Workspace used for child-row eligibility and purging.
  pub fn with_workspace(mut self, workspace: i64) -> Self {
    self.workspace = workspace;
    self
  }

  /// Keep delete placeholders among child rows.
  pub fn with_delete_placeholders(mut self, include: bool) -> Self {
    self.include_delete_placeholders = include;
    self
  }

  /// Populate the handler for one field of one record.
  ///
  /// - `raw`: the field's stored value, parsed as a list unless a junction
  ///   table or parent pointer supplies the relations;
  /// - `allowed`: comma-separated allowed tables or `*`;
  /// - `mm`: junction table, used only for saved owners (`owner_uid > 0`).
  pub fn start(
    &mut self,
    raw: &str,
    allowed: &str,
    mm: Option<&str>,
    owner_uid: i64,
    owner_table: &str,
    config: &RelationConfig,
  ) -> Result<()> {
    self.reset();
    self.config = config.clone();
    self.tables = self.schema.resolve_allowed(allowed);
    if self.tables.is_empty() {
      tracing::warn!(
        owner_table,
        owner_uid,
        allowed,
        "relation allows no known table; resolving to nothing"
      );
      return Ok(());
    }
    for table in &self.tables {
      self.table_array.insert(table.clone(), Vec::new());
    }

    self.mm = mm.filter(|m| !m.is_empty()).map(|m| self.mm_state(m));

    if self.mm.is_some() && owner_uid > 0 {
      self.read_mm(owner_uid, owner_table)?;
    } else if self.config.foreign_field.is_some() {
      if owner_uid > 0 {
        self.read_foreign_field(owner_uid, owner_table)?;
      }
    } else {
      self.read_list(raw);
      if let Some(sort_by) = self.config.default_sort_by.clone() {
        self.sort_list(&sort_by)?;
      }
    }
    Ok(())
  }

  fn reset(&mut self) {
    self.tables.clear();
    self.mm = None;
    self.table_array.clear();
    self.item_array.clear();
    self.non_table_array.clear();
    self.purged = false;
  }

  fn mm_state(&self, table: &str) -> MmState {
    let side = if self.config.mm_opposite_field.is_some() {
      JunctionSide::Foreign
    } else {
      JunctionSide::Local
    };

    // The opposite field lives on the local-side table, which is the first
    // allowed table from this side's point of view.
    let opposite_multi = match (&self.config.mm_opposite_field, self.tables.first()) {
      (Some(field), Some(local_table)) => match self.schema.field(local_table, field) {
        Some(crate::schema::FieldConfig::Relation(rc)) => {
          self.schema.resolve_allowed(&rc.allowed).len() > 1
        }
        _ => false,
      },
      _ => false,
    };

    MmState {
      table: table.to_owned(),
      side,
      match_fields: self.config.mm_match_fields.clone(),
      insert_fields: self.config.mm_insert_fields.clone(),
      has_uid: self.config.mm_has_uid_field,
      tablenames: side == JunctionSide::Local && self.tables.len() > 1,
      opposite_multi,
    }
  }

  fn read_list(&mut self, raw: &str) {
    let parsed = parse_list(raw, &self.tables, self.config.register_non_table_values);
    for item in parsed.items {
      self.push_item(item);
    }
    self.non_table_array = parsed.non_table;
  }

  /// Re-order a single-table list by a column of the target rows.
  fn sort_list(&mut self, sort_by: &str) -> Result<()> {
    let populated: Vec<&String> = self
      .table_array
      .iter()
      .filter(|(_, ids)| !ids.is_empty())
      .map(|(t, _)| t)
      .collect();
    let [table] = populated.as_slice() else {
      return Ok(());
    };
    let table = (*table).clone();
    let order = SortOrder::parse(sort_by);
    let rows = self
      .store
      .get_records(&table, &self.table_array[&table])
      .map_err(Error::store)?;
    let keys: HashMap<i64, SortKey> = rows
      .iter()
      .map(|r| (r.uid, SortKey::of(r, order.column)))
      .collect();

    self.item_array.sort_by(|a, b| {
      let ka = keys.get(&a.uid).cloned().unwrap_or(SortKey::Missing);
      let kb = keys.get(&b.uid).cloned().unwrap_or(SortKey::Missing);
      order.apply(ka.cmp(&kb)).then(a.uid.cmp(&b.uid))
    });
    self.rebuild_table_array();
    Ok(())
  }

  fn push_item(&mut self, item: RelationItem) {
    if let Some(ids) = self.table_array.get_mut(&item.table) {
      ids.push(item.uid);
      self.item_array.push(item);
    }
  }

  fn rebuild_table_array(&mut self) {
    for ids in self.table_array.values_mut() {
      ids.clear();
    }
    for item in &self.item_array {
      if let Some(ids) = self.table_array.get_mut(&item.table) {
        ids.push(item.uid);
      }
    }
  }

  // ── Accessors ─────────────────────────────────────────────────────────

  /// Resolved pairs in authoritative order.
  pub fn item_array(&self) -> &[RelationItem] { &self.item_array }

  /// Allowed table → uids, in item order.
  pub fn table_array(&self) -> &BTreeMap<String, Vec<i64>> { &self.table_array }

  pub fn non_table_array(&self) -> &[String] { &self.non_table_array }

  /// Resolved allowed tables, default table first.
  pub fn tables(&self) -> &[String] { &self.tables }

  pub fn count_items(&self) -> usize { self.item_array.len() }

  /// Whether a purge removed any originally resolved uid.
  pub fn is_purged(&self) -> bool { self.purged }

  pub fn is_mm(&self) -> bool { self.mm.is_some() }

  /// Replace the working set, dropping pairs whose table is not allowed.
  pub fn set_items(&mut self, items: impl IntoIterator<Item = RelationItem>) {
    self.item_array.clear();
    self.non_table_array.clear();
    for ids in self.table_array.values_mut() {
      ids.clear();
    }
    for item in items {
      self.push_item(item);
    }
  }

  /// Serialized tokens: `table_uid` when `prepend_table_name`, else bare
  /// uids. Registered non-table values follow verbatim.
  pub fn value_list(&self, prepend_table_name: bool) -> Vec<String> {
    self
      .item_array
      .iter()
      .map(|i| {
        if prepend_table_name {
          format!("{}_{}", i.table, i.uid)
        } else {
          i.uid.to_string()
        }
      })
      .chain(self.non_table_array.iter().cloned())
      .collect()
  }

  /// The field value for list relations. Table names are prepended whenever
  /// more than one table is allowed.
  pub fn csv_value(&self) -> String { self.value_list(self.tables.len() > 1).join(",") }

  /// Load the target rows in item order; missing rows are skipped.
  pub fn resolved_records(&self) -> Result<Vec<Record>> {
    let mut by_key: HashMap<(String, i64), Record> = HashMap::new();
    for (table, ids) in &self.table_array {
      if ids.is_empty() {
        continue;
      }
      for record in self.store.get_records(table, ids).map_err(Error::store)? {
        by_key.insert((table.clone(), record.uid), record);
      }
    }
    Ok(
      self
        .item_array
        .iter()
        .filter_map(|i| by_key.get(&(i.table.clone(), i.uid)).cloned())
        .collect(),
    )
  }
}

// ─── Sorting helpers ─────────────────────────────────────────────────────────

/// Comparable column value: numbers before text, missing last.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SortKey {
  Int(i64),
  Text(String),
  Missing,
}

impl SortKey {
  pub(crate) fn of(record: &Record, column: &str) -> Self {
    match record.get(column) {
      None | Some(serde_json::Value::Null) => Self::Missing,
      Some(serde_json::Value::Number(_)) => Self::Int(record.int(column)),
      Some(_) => {
        let text = record.text(column);
        match text.trim().parse::<i64>() {
          Ok(n) => Self::Int(n),
          Err(_) => Self::Text(text),
        }
      }
    }
  }
}

/// A sort declaration such as `title` or `crdate DESC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SortOrder<'s> {
  pub column:     &'s str,
  pub descending: bool,
}

impl<'s> SortOrder<'s> {
  pub(crate) fn parse(spec: &'s str) -> Self {
    let mut parts = spec.split_whitespace();
    let column = parts.next().unwrap_or("uid");
    let descending = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
    Self { column, descending }
  }

  pub(crate) fn apply(&self, ord: std::cmp::Ordering) -> std::cmp::Ordering {
    if self.descending { ord.reverse() } else { ord }
  }
}
