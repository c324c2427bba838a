//! Per-field relation extraction.
//!
//! The [`Extractor`] walks one record's fields as the schema describes them
//! and reports what each field (or nested leaf) points at. It does not
//! build index entries; see [`crate::index`].

use serde_json::Value;

use crate::{
  Result,
  record::Record,
  relation::{RelationHandler, RelationItem},
  schema::{FieldConfig, FileConfig, RelationConfig, Schema, SoftRefConfig},
  softref::{SoftRefRegistry, SoftRefResult, TokenContext},
  store::RecordStore,
  tree,
};

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relations {
  /// Resolved record relations in authoritative order.
  Db(Vec<RelationItem>),
  /// File paths in stored order.
  Files(Vec<String>),
  /// One result per recognizer that matched, keyed by recognizer.
  SoftRefs(Vec<(String, SoftRefResult)>),
}

impl Relations {
  pub fn is_empty(&self) -> bool {
    match self {
      Self::Db(items) => items.is_empty(),
      Self::Files(paths) => paths.is_empty(),
      Self::SoftRefs(results) => results.is_empty(),
    }
  }
}

/// The relations of one field location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRelations {
  pub field:     String,
  /// Tree path for nested fields; empty otherwise.
  pub path:      String,
  pub relations: Relations,
}

// ─── Extractor ───────────────────────────────────────────────────────────────

pub struct Extractor<'a, S> {
  store:     &'a S,
  schema:    &'a Schema,
  registry:  &'a SoftRefRegistry,
  workspace: i64,
}

impl<'a, S: RecordStore> Extractor<'a, S> {
  pub fn new(store: &'a S, schema: &'a Schema, registry: &'a SoftRefRegistry) -> Self {
    Self { store, schema, registry, workspace: 0 }
  }

  pub fn with_workspace(mut self, workspace: i64) -> Self {
    self.workspace = workspace;
    self
  }

  /// Relations of every configured field, in field-name order. Locations
  /// without relations are omitted.
  pub fn record(&self, record: &Record) -> Result<Vec<FieldRelations>> {
    let Some(table) = self.schema.table(&record.table) else {
      return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for field in table.fields.keys() {
      out.extend(self.field(record, field)?);
    }
    Ok(out)
  }

  /// Relations of one field; nested fields yield one group per leaf.
  pub fn field(&self, record: &Record, field: &str) -> Result<Vec<FieldRelations>> {
    let Some(config) = self.schema.field(&record.table, field) else {
      return Ok(Vec::new());
    };

    let groups = match config {
      FieldConfig::Nested(nested) => {
        let Some(doc) = tree::parse(record.get(field)) else {
          return Ok(Vec::new());
        };
        let mut groups = Vec::new();
        for leaf in tree::walk(&doc, nested) {
          if let Some(relations) = self.leaf(record, field, &leaf.path, leaf.config, &leaf.raw)? {
            groups.push(FieldRelations { field: field.to_owned(), path: leaf.path, relations });
          }
        }
        groups
      }
      other => self
        .leaf(record, field, "", other, &record.text(field))?
        .map(|relations| FieldRelations { field: field.to_owned(), path: String::new(), relations })
        .into_iter()
        .collect(),
    };

    Ok(groups.into_iter().filter(|g| !g.relations.is_empty()).collect())
  }

  fn leaf(
    &self,
    record: &Record,
    field: &str,
    path: &str,
    config: &FieldConfig,
    raw: &str,
  ) -> Result<Option<Relations>> {
    let relations = match config {
      FieldConfig::Plain | FieldConfig::Nested(_) => return Ok(None),
      // The owning side of the junction indexes these edges.
      FieldConfig::Relation(rc) if rc.mm_opposite_field.is_some() && path.is_empty() => {
        return Ok(None);
      }
      FieldConfig::Relation(rc) => {
        let handler = self.relation_handler(record, raw, rc, path.is_empty())?;
        Relations::Db(handler.item_array().to_vec())
      }
      FieldConfig::File(fc) => Relations::Files(file_paths(fc, raw)),
      FieldConfig::SoftReference(sc) => Relations::SoftRefs(self.soft_refs(record, field, path, sc, raw)),
    };
    Ok(Some(relations))
  }

  /// A handler populated for one relation location. Junction tables only
  /// apply to flat fields.
  pub fn relation_handler(
    &self,
    record: &Record,
    raw: &str,
    config: &RelationConfig,
    flat: bool,
  ) -> Result<RelationHandler<'a, S>> {
    let mut handler = RelationHandler::new(self.store, self.schema).with_workspace(self.workspace);
    let mm = if flat { config.mm.as_deref() } else { None };
    handler.start(raw, &config.allowed, mm, record.uid, &record.table, config)?;
    Ok(handler)
  }

  /// Run each configured recognizer over the original text.
  pub fn soft_refs(
    &self,
    record: &Record,
    field: &str,
    path: &str,
    config: &SoftRefConfig,
    raw: &str,
  ) -> Vec<(String, SoftRefResult)> {
    let mut out = Vec::new();
    if raw.is_empty() {
      return out;
    }
    for key in &config.recognizers {
      let Some(parser) = self.registry.get(key) else {
        tracing::warn!(table = %record.table, field, key = %key, "unknown soft reference recognizer");
        continue;
      };
      let ctx = TokenContext { table: &record.table, uid: record.uid, field, path, key };
      if let Some(result) = parser.parse(raw, &ctx) {
        out.push((key.clone(), result));
      }
    }
    out
  }
}

/// Full paths of a stored file list.
pub fn file_paths(config: &FileConfig, raw: &str) -> Vec<String> {
  file_names(raw).map(|name| config.path_of(name)).collect()
}

pub(crate) fn file_names(raw: &str) -> impl Iterator<Item = &str> {
  raw.split(',').map(str::trim).filter(|n| !n.is_empty())
}

/// Stored form of a nested document after a leaf change: text when the
/// field held text, the document itself otherwise.
pub(crate) fn stored_tree(original: Option<&Value>, doc: &Value) -> Result<Value> {
  match original {
    Some(Value::String(_)) | None => Ok(Value::String(serde_json::to_string(doc)?)),
    Some(_) => Ok(doc.clone()),
  }
}
