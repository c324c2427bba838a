//! The schema registry: which tables exist and what kind of relation each
//! field holds.
//!
//! The registry is plain data. Binaries load it from TOML; tests build it in
//! code. Every consumer receives it by reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
  #[serde(default)]
  pub tables: BTreeMap<String, TableSchema>,
}

impl Schema {
  pub fn table(&self, name: &str) -> Option<&TableSchema> { self.tables.get(name) }

  pub fn contains(&self, name: &str) -> bool { self.tables.contains_key(name) }

  /// Known table names in stable (sorted) order.
  pub fn table_names(&self) -> impl Iterator<Item = &str> {
    self.tables.keys().map(String::as_str)
  }

  pub fn field(&self, table: &str, field: &str) -> Option<&FieldConfig> {
    self.table(table)?.fields.get(field)
  }

  /// Resolve an allowed-tables list into known table names.
  ///
  /// `*` expands to every known table. Unknown names are dropped and
  /// duplicates collapse onto their first position, so the result may be
  /// empty for a misconfigured field.
  pub fn resolve_allowed(&self, allowed: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in allowed.split(',').map(str::trim).filter(|s| !s.is_empty()) {
      if name == "*" {
        for known in self.table_names() {
          if !out.iter().any(|t| t == known) {
            out.push(known.to_owned());
          }
        }
      } else if self.contains(name) && !out.iter().any(|t| t == name) {
        out.push(name.to_owned());
      }
    }
    out
  }
}

// ─── Tables ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
  /// Soft-delete flag column, if the table soft-deletes.
  #[serde(default)]
  pub delete_field:       Option<String>,
  /// Whether rows carry workspace version columns.
  #[serde(default)]
  pub versioning:         bool,
  /// Manual sorting column.
  #[serde(default)]
  pub sort_field:         Option<String>,
  /// Column used when nothing more specific orders a relation.
  #[serde(default)]
  pub default_sort_by:    Option<String>,
  /// Tables whose rows never produce index entries (logs, caches, the index
  /// itself).
  #[serde(default)]
  pub exclude_from_index: bool,
  #[serde(default)]
  pub fields:             BTreeMap<String, FieldConfig>,
}

// ─── Fields ──────────────────────────────────────────────────────────────────

/// Relation kind of a field. The variant name is the `type` tag in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldConfig {
  Plain,
  Relation(RelationConfig),
  File(FileConfig),
  Nested(NestedConfig),
  SoftReference(SoftRefConfig),
}

/// A foreign-key list: CSV, junction table, or children keyed by parent id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationConfig {
  /// Comma-separated allowed tables, or `*`.
  pub allowed: String,

  // ── Junction table ──────────────────────────────────────────────────────
  #[serde(default)]
  pub mm:                Option<String>,
  /// Set on the foreign side of a symmetric junction: names the field on
  /// the local-side table that owns the junction.
  #[serde(default)]
  pub mm_opposite_field: Option<String>,
  /// Columns restricting the junction rows to this usage.
  #[serde(default)]
  pub mm_match_fields:   BTreeMap<String, String>,
  /// Extra columns written on insert only.
  #[serde(default)]
  pub mm_insert_fields:  BTreeMap<String, String>,
  /// Junction rows have their own `uid` column.
  #[serde(default)]
  pub mm_has_uid_field:  bool,

  // ── Children keyed by parent id ─────────────────────────────────────────
  #[serde(default)]
  pub foreign_field:          Option<String>,
  /// Child column holding the owner's table name.
  #[serde(default)]
  pub foreign_table_field:    Option<String>,
  #[serde(default)]
  pub foreign_match_fields:   BTreeMap<String, String>,
  /// Second parent pointer for bidirectional relations.
  #[serde(default)]
  pub symmetric_field:        Option<String>,
  #[serde(default)]
  pub foreign_sortby:         Option<String>,
  #[serde(default)]
  pub symmetric_sortby:       Option<String>,
  #[serde(default)]
  pub foreign_default_sortby: Option<String>,

  // ── Lists ───────────────────────────────────────────────────────────────
  /// Re-order list relations by this target column after parsing.
  #[serde(default)]
  pub default_sort_by:           Option<String>,
  /// Keep tokens that are not valid `table_id` pairs as opaque values.
  #[serde(default)]
  pub register_non_table_values: bool,
}

impl RelationConfig {
  pub fn new(allowed: impl Into<String>) -> Self {
    Self { allowed: allowed.into(), ..Default::default() }
  }
}

/// A comma-separated list of file names stored relative to a folder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
  #[serde(default)]
  pub upload_folder: String,
}

impl FileConfig {
  /// Full path of a stored file name.
  pub fn path_of(&self, name: &str) -> String {
    let folder = self.upload_folder.trim_end_matches('/');
    if folder.is_empty() {
      name.to_owned()
    } else {
      format!("{folder}/{name}")
    }
  }

  /// Inverse of [`path_of`](Self::path_of) for paths inside the folder;
  /// other paths are kept verbatim.
  pub fn name_of<'a>(&self, path: &'a str) -> &'a str {
    let folder = self.upload_folder.trim_end_matches('/');
    if folder.is_empty() {
      return path;
    }
    path
      .strip_prefix(folder)
      .and_then(|rest| rest.strip_prefix('/'))
      .unwrap_or(path)
  }
}

/// A JSON tree whose leaves are configured by the key holding them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NestedConfig {
  #[serde(default)]
  pub fields: BTreeMap<String, FieldConfig>,
}

/// Free text scanned by the listed recognizers, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftRefConfig {
  pub recognizers: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn schema() -> Schema {
    let mut s = Schema::default();
    s.tables.insert("page".into(), TableSchema::default());
    s.tables.insert("content".into(), TableSchema::default());
    s
  }

  #[test]
  fn resolve_allowed_drops_unknown_tables() {
    let s = schema();
    assert_eq!(s.resolve_allowed("page, missing ,content"), ["page", "content"]);
    assert!(s.resolve_allowed("missing").is_empty());
  }

  #[test]
  fn resolve_allowed_star_expands_to_all_tables() {
    let s = schema();
    assert_eq!(s.resolve_allowed("page,*"), ["page", "content"]);
  }

  #[test]
  fn field_config_deserializes_from_tagged_json() {
    let json = serde_json::json!({
      "tables": {
        "item": {
          "delete_field": "deleted",
          "fields": {
            "refs":  { "type": "relation", "allowed": "page" },
            "image": { "type": "file", "upload_folder": "uploads/" },
            "body":  { "type": "soft_reference", "recognizers": ["typolink"] },
            "title": { "type": "plain" }
          }
        }
      }
    });
    let s: Schema = serde_json::from_value(json).unwrap();
    let item = s.table("item").unwrap();
    assert_eq!(item.delete_field.as_deref(), Some("deleted"));
    assert!(matches!(item.fields["refs"], FieldConfig::Relation(ref r) if r.allowed == "page"));
    assert!(matches!(item.fields["title"], FieldConfig::Plain));
  }

  #[test]
  fn file_paths_round_trip_through_upload_folder() {
    let cfg = FileConfig { upload_folder: "uploads/".into() };
    assert_eq!(cfg.path_of("a.jpg"), "uploads/a.jpg");
    assert_eq!(cfg.name_of("uploads/a.jpg"), "a.jpg");
    assert_eq!(cfg.name_of("elsewhere/a.jpg"), "elsewhere/a.jpg");
  }
}
