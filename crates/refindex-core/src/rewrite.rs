//! Targeted rewrite of a single indexed reference.
//!
//! [`ReferenceIndex::set_reference_value`] turns an index row back into the
//! field location it came from, replaces or removes that one occurrence and
//! returns the new field value as a [`WriteBack`]. Nothing is written until
//! the caller passes the instruction to
//! [`ReferenceIndex::apply_write_back`].
//!
//! Record and file occurrences are located by their sort position. Every
//! applied removal shifts the positions after it; applying a write-back
//! reindexes the record, which moves the remaining rows along. Rows computed
//! before such a change are refused as drift until the record is reindexed.
//! Callers removing several occurrences of one field without reindexing in
//! between go from the highest position down.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
  Error, Result,
  entry::ReferenceEntry,
  extract::{file_names, stored_tree},
  index::{ReferenceIndex, UpdateResult},
  record::Record,
  relation::{RelationHandler, RelationItem},
  schema::FieldConfig,
  softref::{TOKEN_PREFIX, TokenContext},
  store::{IndexStore, RecordStore},
  tree,
};

/// Why a rewrite was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Refusal {
  #[error("no index row with hash {0}")]
  UnknownHash(String),

  #[error("table {0} is not in the schema")]
  UnknownTable(String),

  #[error("record {table}:{uid} does not exist")]
  RecordMissing { table: String, uid: i64 },

  #[error("{0}")]
  Drift(String),

  #[error("field {table}.{field} cannot be rewritten: {reason}")]
  UnsupportedField { table: String, field: String, reason: &'static str },

  #[error("{value:?} is not a valid replacement: {reason}")]
  InvalidValue { value: String, reason: &'static str },

  #[error("rewriting {field} of {table}:{uid} would leave placeholder tokens behind")]
  ResidualTokens { table: String, uid: i64, field: String },
}

/// A computed field change, ready for [`ReferenceIndex::apply_write_back`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteBack {
  pub table:     String,
  pub uid:       i64,
  pub field:     String,
  /// Tree path of the changed leaf; empty for flat fields.
  pub path:      String,
  /// The whole new field value.
  pub value:     Value,
  /// New relation list for junction and child relations, whose targets
  /// live outside the field itself.
  pub relations: Option<Vec<RelationItem>>,
}

/// New leaf text plus, for external relations, the item list.
type LeafChange = (String, Option<Vec<RelationItem>>);

impl<S: RecordStore + IndexStore> ReferenceIndex<'_, S> {
  /// Replace (`Some`) or remove (`None`) the occurrence recorded by `hash`.
  ///
  /// Record targets are given as `table:uid`, files as a path and soft
  /// references as the literal replacement text. The caller is responsible
  /// for only rewriting live content.
  pub fn set_reference_value(
    &self,
    hash: &str,
    new_value: Option<&str>,
  ) -> Result<Result<WriteBack, Refusal>> {
    let Some(entry) = self.store.index_row(hash).map_err(Error::store)? else {
      return Ok(Err(Refusal::UnknownHash(hash.to_owned())));
    };
    if !self.schema.contains(&entry.tablename) {
      return Ok(Err(Refusal::UnknownTable(entry.tablename)));
    }
    let Some(record) = self
      .store
      .get_record(&entry.tablename, entry.recuid)
      .map_err(Error::store)?
    else {
      return Ok(Err(Refusal::RecordMissing { table: entry.tablename, uid: entry.recuid }));
    };
    let Some(config) = self.schema.field(&entry.tablename, &entry.field) else {
      return Ok(Err(unsupported(&entry, "not configured")));
    };

    let write_back = if entry.flexpointer.is_empty() {
      let raw = record.text(&entry.field);
      match self.rewrite_leaf(&entry, &record, config, &raw, true, new_value)? {
        Ok((text, relations)) => {
          let value = match &relations {
            Some(items) => Value::from(items.len()),
            None => Value::String(text),
          };
          WriteBack {
            table: entry.tablename,
            uid: entry.recuid,
            field: entry.field,
            path: String::new(),
            value,
            relations,
          }
        }
        Err(refusal) => return Ok(Err(refusal)),
      }
    } else {
      let FieldConfig::Nested(nested) = config else {
        return Ok(Err(drift(&entry, "the field is no longer nested")));
      };
      let original = record.get(&entry.field);
      let Some(mut doc) = tree::parse(original) else {
        return Ok(Err(drift(&entry, "the field no longer holds a document")));
      };
      let Some(leaf) = tree::walk(&doc, nested)
        .into_iter()
        .find(|l| l.path == entry.flexpointer)
      else {
        return Ok(Err(drift(&entry, "the tree path no longer exists")));
      };
      let text = match self.rewrite_leaf(&entry, &record, leaf.config, &leaf.raw, false, new_value)? {
        Ok((text, _)) => text,
        Err(refusal) => return Ok(Err(refusal)),
      };
      let value = match tree::leaf(&doc, &entry.flexpointer) {
        Some(current) => tree::leaf_value(current, &text),
        None => Value::String(text),
      };
      tree::set_leaf(&mut doc, &entry.flexpointer, value);
      WriteBack {
        value: stored_tree(original, &doc)?,
        table: entry.tablename,
        uid: entry.recuid,
        field: entry.field,
        path: entry.flexpointer,
        relations: None,
      }
    };
    Ok(Ok(write_back))
  }

  fn rewrite_leaf(
    &self,
    entry: &ReferenceEntry,
    record: &Record,
    config: &FieldConfig,
    raw: &str,
    flat: bool,
    new_value: Option<&str>,
  ) -> Result<Result<LeafChange, Refusal>> {
    match config {
      FieldConfig::Relation(rc) if !entry.is_soft_reference() => {
        if !flat && rc.foreign_field.is_some() {
          return Ok(Err(unsupported(entry, "child relations inside a tree")));
        }
        let mut handler = self.extractor().relation_handler(record, raw, rc, flat)?;
        Ok(rewrite_items(entry, &handler, new_value).map(|items| {
          let external = handler.is_mm() || rc.foreign_field.is_some();
          handler.set_items(items.clone());
          (handler.csv_value(), external.then_some(items))
        }))
      }
      FieldConfig::File(fc) if !entry.is_soft_reference() => {
        let mut names: Vec<String> = file_names(raw).map(str::to_owned).collect();
        let Some(position) = position_of(entry, names.len()) else {
          return Ok(Err(drift(entry, "the file list is shorter than the indexed position")));
        };
        if fc.path_of(&names[position]) != entry.ref_string {
          return Ok(Err(drift(entry, "another file now occupies the indexed position")));
        }
        match new_value.map(str::trim) {
          Some("") => {
            return Ok(Err(invalid("", "a file path must not be empty")));
          }
          Some(path) => names[position] = fc.name_of(path).to_owned(),
          None => {
            names.remove(position);
          }
        }
        Ok(Ok((names.join(","), None)))
      }
      FieldConfig::SoftReference(_) if entry.is_soft_reference() => {
        let Some(parser) = self.registry.get(&entry.softref_key) else {
          return Ok(Err(unsupported(entry, "the recognizer is not registered")));
        };
        let ctx = TokenContext {
          table: &entry.tablename,
          uid: entry.recuid,
          field: &entry.field,
          path: &entry.flexpointer,
          key: &entry.softref_key,
        };
        let Some(parsed) = parser.parse(raw, &ctx) else {
          return Ok(Err(drift(entry, "the text no longer holds any match")));
        };
        if parsed.element(&entry.softref_id).is_none() {
          return Ok(Err(drift(entry, "the indexed match is no longer present")));
        }
        let text = parsed.substitute(&entry.softref_id, new_value);
        if text.matches(TOKEN_PREFIX).count() > raw.matches(TOKEN_PREFIX).count() {
          return Ok(Err(Refusal::ResidualTokens {
            table: entry.tablename.clone(),
            uid: entry.recuid,
            field: entry.field.clone(),
          }));
        }
        Ok(Ok((text, None)))
      }
      FieldConfig::Relation(_) | FieldConfig::File(_) | FieldConfig::SoftReference(_) => {
        Ok(Err(drift(entry, "the field kind no longer matches the indexed reference")))
      }
      FieldConfig::Plain | FieldConfig::Nested(_) => Ok(Err(unsupported(entry, "it holds no references"))),
    }
  }

  /// Carry out a [`WriteBack`] and reindex the record.
  ///
  /// Junction relations are rewritten through the junction table and child
  /// relations through the child rows; everything else is a plain field
  /// update.
  pub fn apply_write_back(&self, write_back: &WriteBack) -> Result<UpdateResult> {
    let WriteBack { table, uid, field, value, relations, .. } = write_back;

    if let (Some(items), Some(FieldConfig::Relation(rc))) = (relations, self.schema.field(table, field)) {
      let record = self
        .store
        .get_record(table, *uid)
        .map_err(Error::store)?
        .unwrap_or_else(|| Record::new(table.as_str(), *uid));
      let mut handler = self.extractor().relation_handler(&record, &record.text(field), rc, true)?;
      handler.set_items(items.iter().cloned());
      if handler.is_mm() {
        handler.write_mm(*uid, table, Some(self))?;
      } else {
        handler.write_foreign_field(*uid, table, Some(self))?;
      }
    }

    let values = BTreeMap::from([(field.clone(), value.clone())]);
    self.store.update_fields(table, *uid, &values).map_err(Error::store)?;
    tracing::debug!(table = %table, uid, field = %field, "applied reference rewrite");
    self.update_ref_index_table(table, *uid, false)
  }
}

/// Replace or remove the item at the entry's position.
fn rewrite_items<S: RecordStore>(
  entry: &ReferenceEntry,
  handler: &RelationHandler<'_, S>,
  new_value: Option<&str>,
) -> Result<Vec<RelationItem>, Refusal> {
  let mut items = handler.item_array().to_vec();
  let Some(position) = position_of(entry, items.len()) else {
    return Err(drift(entry, "the relation list is shorter than the indexed position"));
  };
  let current = &items[position];
  if current.table != entry.ref_table || current.uid != entry.ref_uid {
    return Err(drift(entry, "another record now occupies the indexed position"));
  }

  match new_value {
    Some(value) => {
      let item = parse_record_value(value)?;
      if !handler.tables().contains(&item.table) {
        return Err(invalid(value, "the table is not allowed by the relation"));
      }
      items[position] = item;
    }
    None => {
      items.remove(position);
    }
  }
  Ok(items)
}

/// `table:uid` with a positive uid.
fn parse_record_value(value: &str) -> Result<RelationItem, Refusal> {
  let Some((table, uid)) = value.trim().rsplit_once(':') else {
    return Err(invalid(value, "expected table:uid"));
  };
  match uid.parse::<i64>() {
    Ok(uid) if uid > 0 && !table.is_empty() => Ok(RelationItem::new(table, uid)),
    _ => Err(invalid(value, "expected table:uid with a positive uid")),
  }
}

fn position_of(entry: &ReferenceEntry, len: usize) -> Option<usize> {
  usize::try_from(entry.sorting).ok().filter(|p| *p < len)
}

fn drift(entry: &ReferenceEntry, what: &str) -> Refusal {
  let location = if entry.flexpointer.is_empty() {
    entry.field.clone()
  } else {
    format!("{}:{}", entry.field, entry.flexpointer)
  };
  Refusal::Drift(format!(
    "{}:{} field {location} changed since it was indexed: {what}",
    entry.tablename, entry.recuid
  ))
}

fn unsupported(entry: &ReferenceEntry, reason: &'static str) -> Refusal {
  Refusal::UnsupportedField { table: entry.tablename.clone(), field: entry.field.clone(), reason }
}

fn invalid(value: &str, reason: &'static str) -> Refusal {
  Refusal::InvalidValue { value: value.to_owned(), reason }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_values_need_a_table_and_positive_uid() {
    assert_eq!(parse_record_value("page:5").unwrap(), RelationItem::new("page", 5));
    assert_eq!(parse_record_value(" tt_content:12 ").unwrap(), RelationItem::new("tt_content", 12));
    assert!(parse_record_value("page").is_err());
    assert!(parse_record_value("page:0").is_err());
    assert!(parse_record_value(":5").is_err());
  }

  #[test]
  fn drift_messages_name_the_location() {
    let entry = ReferenceEntry {
      hash: String::new(),
      tablename: "item".into(),
      recuid: 3,
      field: "settings".into(),
      flexpointer: "link/".into(),
      softref_key: String::new(),
      softref_id: String::new(),
      sorting: 0,
      occurrence: 0,
      deleted: false,
      workspace: 0,
      ref_table: "page".into(),
      ref_uid: 1,
      ref_string: String::new(),
    };
    let message = drift(&entry, "gone").to_string();
    assert_eq!(message, "item:3 field settings:link/ changed since it was indexed: gone");
  }
}
