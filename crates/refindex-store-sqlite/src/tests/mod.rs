//! Integration tests for `SqliteStore` and the core algorithms running on it,
//! against an in-memory database.

mod rewrite;

use refindex_core::{
  entry::ReferenceEntry,
  index::ReferenceIndex,
  record::Record,
  relation::RelationHandler,
  schema::{FieldConfig, RelationConfig, Schema},
  softref::SoftRefRegistry,
  store::{IndexFilter, IndexStore, RecordStore},
};
use serde_json::json;

use crate::SqliteStore;

/// A small repository: versioned `page` and `content` tables, an unversioned
/// `item` table holding every kind of reference, and an excluded `log`.
pub(crate) fn schema() -> Schema {
  serde_json::from_value(json!({
    "tables": {
      "page": {
        "versioning": true,
        "delete_field": "deleted",
        "sort_field": "sorting",
        "fields": {
          "title": { "type": "plain" },
          "items": {
            "type": "relation",
            "allowed": "item",
            "mm": "item_page_mm",
            "mm_opposite_field": "pages"
          }
        }
      },
      "content": {
        "versioning": true,
        "delete_field": "deleted",
        "sort_field": "sorting",
        "fields": {
          "title": { "type": "plain" },
          "siblings": {
            "type": "relation",
            "allowed": "content",
            "foreign_field": "peer_a",
            "symmetric_field": "peer_b",
            "foreign_sortby": "sort_a",
            "symmetric_sortby": "sort_b"
          }
        }
      },
      "item": {
        "delete_field": "deleted",
        "fields": {
          "title":    { "type": "plain" },
          "refs":     { "type": "relation", "allowed": "page" },
          "mixed": {
            "type": "relation",
            "allowed": "page,content",
            "register_non_table_values": true
          },
          "sorted": { "type": "relation", "allowed": "page", "default_sort_by": "title" },
          "pages":  { "type": "relation", "allowed": "page", "mm": "item_page_mm" },
          "children": {
            "type": "relation",
            "allowed": "content",
            "foreign_field": "parent",
            "foreign_table_field": "parent_table"
          },
          "image": { "type": "file", "upload_folder": "uploads" },
          "body":  { "type": "soft_reference", "recognizers": ["typolink", "email"] },
          "settings": {
            "type": "nested",
            "fields": {
              "link": { "type": "relation", "allowed": "page" },
              "note": { "type": "soft_reference", "recognizers": ["url"] }
            }
          }
        }
      },
      "log": {
        "exclude_from_index": true,
        "fields": {
          "ref": { "type": "relation", "allowed": "page" }
        }
      }
    }
  }))
  .expect("fixture schema")
}

pub(crate) struct Fixture {
  pub store:    SqliteStore,
  pub schema:   Schema,
  pub registry: SoftRefRegistry,
}

impl Fixture {
  pub fn new() -> Self {
    let schema = schema();
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    store.ensure_schema(&schema).expect("content tables");
    Self { store, schema, registry: SoftRefRegistry::with_defaults() }
  }

  pub fn index(&self) -> ReferenceIndex<'_, SqliteStore> {
    ReferenceIndex::new(&self.store, &self.schema, &self.registry)
  }

  pub fn insert(&self, record: Record) -> i64 { self.store.insert_record(&record).expect("insert") }

  pub fn record(&self, table: &str, uid: i64) -> Record {
    self
      .store
      .get_record(table, uid)
      .expect("read")
      .expect("record exists")
  }

  pub fn handler(&self) -> RelationHandler<'_, SqliteStore> {
    RelationHandler::new(&self.store, &self.schema)
  }

  pub fn relation(&self, table: &str, field: &str) -> RelationConfig {
    match self.schema.field(table, field) {
      Some(FieldConfig::Relation(rc)) => rc.clone(),
      other => panic!("{table}.{field} is not a relation: {other:?}"),
    }
  }

  /// Live-workspace index rows held by one record.
  pub fn rows(&self, table: &str, uid: i64) -> Vec<ReferenceEntry> {
    self
      .store
      .index_rows(&IndexFilter::source(table, uid, 0))
      .expect("index rows")
  }

  /// Every live page titled by its uid, so relations have real targets.
  pub fn pages(&self, uids: &[i64]) {
    for &uid in uids {
      self.insert(Record::new("page", uid).with("title", format!("page {uid}")));
    }
  }
}
