use std::collections::BTreeMap;

use refindex_core::{
  entry::ReferenceEntry,
  record::Record,
  relation::RelationItem,
  rewrite::{Refusal, WriteBack},
  store::RecordStore,
};
use serde_json::{Value, json};

use super::Fixture;

/// Index `item` 1 and return its rows for `field`.
fn indexed(fx: &Fixture, field: &str) -> Vec<ReferenceEntry> {
  fx.index().update_ref_index_table("item", 1, false).unwrap();
  fx.rows("item", 1).into_iter().filter(|r| r.field == field).collect()
}

fn rewrite(fx: &Fixture, entry: &ReferenceEntry, value: Option<&str>) -> Result<WriteBack, Refusal> {
  fx.index().set_reference_value(&entry.hash, value).unwrap()
}

fn apply(fx: &Fixture, entry: &ReferenceEntry, value: Option<&str>) {
  let write_back = rewrite(fx, entry, value).expect("rewrite accepted");
  fx.index().apply_write_back(&write_back).unwrap();
}

// ─── Record lists ────────────────────────────────────────────────────────────

#[test]
fn replacing_a_record_in_a_list() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("refs", "page_5,page_9"));
  let rows = indexed(&fx, "refs");

  let write_back = rewrite(&fx, &rows[1], Some("page:7")).unwrap();
  assert_eq!(write_back.value, Value::from("5,7"));
  assert!(write_back.path.is_empty());
  assert!(write_back.relations.is_none());

  let result = fx.index().apply_write_back(&write_back).unwrap();
  assert_eq!((result.kept, result.added, result.deleted), (1, 1, 1));
  assert_eq!(fx.record("item", 1).text("refs"), "5,7");
  assert_eq!(fx.index().references_to("page", 7).unwrap().len(), 1);
  assert!(fx.index().references_to("page", 9).unwrap().is_empty());
}

#[test]
fn removing_from_the_highest_position_down() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("refs", "page_5,page_9,page_7"));
  let mut rows = indexed(&fx, "refs");
  rows.sort_by_key(|r| std::cmp::Reverse(r.sorting));

  for row in &rows {
    apply(&fx, row, None);
  }
  assert_eq!(fx.record("item", 1).text("refs"), "");
  assert!(fx.rows("item", 1).is_empty());
}

#[test]
fn removing_from_the_lowest_position_up_follows_the_reindex() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("refs", "page_5,page_9,page_7"));
  let rows = indexed(&fx, "refs");

  apply(&fx, &rows[0], None);
  assert_eq!(fx.record("item", 1).text("refs"), "9,7");
  // Applying reindexed the record, so page 9 is now found at position 0.
  apply(&fx, &rows[1], None);
  assert_eq!(fx.record("item", 1).text("refs"), "7");
  apply(&fx, &rows[2], None);
  assert!(fx.rows("item", 1).is_empty());
}

#[test]
fn reordered_fields_drift_until_reindexed() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("refs", "page_5,page_9"));
  let rows = indexed(&fx, "refs");

  fx.store
    .update_fields("item", 1, &BTreeMap::from([("refs".to_owned(), Value::from("page_9,page_5"))]))
    .unwrap();
  let refusal = rewrite(&fx, &rows[1], Some("page:7")).unwrap_err();
  assert!(matches!(refusal, Refusal::Drift(ref m) if m.contains("another record")));

  fx.index().update_ref_index_table("item", 1, false).unwrap();
  let write_back = rewrite(&fx, &rows[1], Some("page:7")).unwrap();
  assert_eq!(write_back.value, Value::from("7,5"));
}

#[test]
fn repeated_targets_are_rewritten_one_at_a_time() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("refs", "page_5,page_5,page_9"));
  let rows = indexed(&fx, "refs");
  assert_eq!(rows.len(), 3);

  apply(&fx, &rows[1], None);
  assert_eq!(fx.record("item", 1).text("refs"), "5,9");
  let left: Vec<(i64, i64)> = fx.rows("item", 1).iter().map(|r| (r.ref_uid, r.sorting)).collect();
  assert_eq!(left, [(5, 0), (9, 1)]);
}

#[test]
fn replacements_must_name_an_allowed_record() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("refs", "page_5"));
  let rows = indexed(&fx, "refs");

  for value in ["content:3", "page", "page:-1"] {
    let refusal = rewrite(&fx, &rows[0], Some(value)).unwrap_err();
    assert!(matches!(refusal, Refusal::InvalidValue { .. }), "{value}: {refusal:?}");
  }
}

#[test]
fn stale_rows_are_refused() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("refs", "page_5"));
  let rows = indexed(&fx, "refs");

  assert_eq!(
    fx.index().set_reference_value("nope", None).unwrap().unwrap_err(),
    Refusal::UnknownHash("nope".into())
  );

  fx.store.delete_record("item", 1).unwrap();
  assert_eq!(rewrite(&fx, &rows[0], None).unwrap_err(), Refusal::RecordMissing {
    table: "item".into(),
    uid:   1,
  });
}

// ─── Junction relations ──────────────────────────────────────────────────────

#[test]
fn junction_rewrites_go_through_the_junction_table() {
  let fx = Fixture::new();
  fx.pages(&[3, 4]);
  fx.insert(Record::new("item", 1).with("title", "owner"));
  let rc = fx.relation("item", "pages");
  let mut h = fx.handler();
  h.start("", &rc.allowed, rc.mm.as_deref(), 1, "item", &rc).unwrap();
  h.set_items([RelationItem::new("page", 3), RelationItem::new("page", 4)]);
  h.write_mm(1, "item", None).unwrap();

  let rows = indexed(&fx, "pages");
  assert_eq!(rows.len(), 2);

  let write_back = rewrite(&fx, &rows[0], None).unwrap();
  assert_eq!(write_back.value, Value::from(1));
  assert_eq!(write_back.relations, Some(vec![RelationItem::new("page", 4)]));

  fx.index().apply_write_back(&write_back).unwrap();
  assert!(fx.index().references_to("page", 3).unwrap().is_empty());
  assert_eq!(fx.index().references_to("page", 4).unwrap().len(), 1);
  assert_eq!(fx.record("item", 1).int("pages"), 1);

  h.start("", &rc.allowed, rc.mm.as_deref(), 1, "item", &rc).unwrap();
  assert_eq!(h.item_array(), [RelationItem::new("page", 4)]);
}

// ─── Files and soft references ───────────────────────────────────────────────

#[test]
fn file_references_are_rewritten_by_name() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("image", "a.jpg,b.jpg"));
  let rows = indexed(&fx, "image");

  let write_back = rewrite(&fx, &rows[1], Some("uploads/c.jpg")).unwrap();
  assert_eq!(write_back.value, Value::from("a.jpg,c.jpg"));
  let write_back = rewrite(&fx, &rows[0], None).unwrap();
  assert_eq!(write_back.value, Value::from("b.jpg"));

  assert!(matches!(
    rewrite(&fx, &rows[0], Some(" ")).unwrap_err(),
    Refusal::InvalidValue { .. }
  ));

  fx.store
    .update_fields("item", 1, &BTreeMap::from([("image".to_owned(), Value::from("z.jpg,b.jpg"))]))
    .unwrap();
  assert!(matches!(rewrite(&fx, &rows[0], None).unwrap_err(), Refusal::Drift(_)));
}

#[test]
fn soft_references_are_substituted_in_place() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("body", "mail a@example.com now"));
  let rows = indexed(&fx, "body");
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].softref_key, "email");

  let write_back = rewrite(&fx, &rows[0], Some("b@example.org")).unwrap();
  assert_eq!(write_back.value, Value::from("mail b@example.org now"));

  let result = fx.index().apply_write_back(&write_back).unwrap();
  assert_eq!((result.added, result.deleted), (1, 1));
  assert_eq!(fx.rows("item", 1)[0].ref_string, "b@example.org");
}

#[test]
fn existing_placeholder_text_does_not_hide_new_tokens() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("body", "keep {softref:legacy} and mail a@example.com"));
  let rows = indexed(&fx, "body");
  assert_eq!(rows.len(), 1);

  let refusal = rewrite(&fx, &rows[0], Some("{softref:abc}")).unwrap_err();
  assert!(matches!(refusal, Refusal::ResidualTokens { .. }));

  let write_back = rewrite(&fx, &rows[0], Some("b@example.org")).unwrap();
  assert_eq!(write_back.value, Value::from("keep {softref:legacy} and mail b@example.org"));
}

#[test]
fn replacements_may_not_smuggle_in_tokens() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("body", "mail a@example.com"));
  let rows = indexed(&fx, "body");

  let refusal = rewrite(&fx, &rows[0], Some("{softref:abc}")).unwrap_err();
  assert_eq!(refusal, Refusal::ResidualTokens {
    table: "item".into(),
    uid:   1,
    field: "body".into(),
  });
}

// ─── Nested fields ───────────────────────────────────────────────────────────

#[test]
fn nested_leaves_are_rewritten_inside_the_document() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("settings", r#"{"link":"page_5","title":"x"}"#));
  let rows = indexed(&fx, "settings");
  assert_eq!(rows[0].flexpointer, "link/");

  let write_back = rewrite(&fx, &rows[0], Some("page:9")).unwrap();
  assert_eq!(write_back.path, "link/");
  let stored: Value = serde_json::from_str(write_back.value.as_str().unwrap()).unwrap();
  assert_eq!(stored, json!({ "link": "9", "title": "x" }));

  fx.index().apply_write_back(&write_back).unwrap();
  let to_nine = fx.index().references_to("page", 9).unwrap();
  assert_eq!(to_nine.len(), 1);
  assert_eq!(to_nine[0].flexpointer, "link/");
}

#[test]
fn array_leaves_stay_arrays() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("settings", r#"{"link":["page_1","page_2"],"title":"x"}"#));
  let rows = indexed(&fx, "settings");
  assert_eq!(rows.len(), 2);

  let write_back = rewrite(&fx, &rows[1], None).unwrap();
  let stored: Value = serde_json::from_str(write_back.value.as_str().unwrap()).unwrap();
  assert_eq!(stored, json!({ "link": ["1"], "title": "x" }));

  fx.index().apply_write_back(&write_back).unwrap();
  assert!(fx.index().references_to("page", 2).unwrap().is_empty());
  assert_eq!(fx.index().references_to("page", 1).unwrap().len(), 1);
}

#[test]
fn vanished_tree_paths_drift() {
  let fx = Fixture::new();
  fx.insert(Record::new("item", 1).with("settings", r#"{"link":"page_5"}"#));
  let rows = indexed(&fx, "settings");

  fx.store
    .update_fields("item", 1, &BTreeMap::from([("settings".to_owned(), Value::from("{}"))]))
    .unwrap();
  let refusal = rewrite(&fx, &rows[0], None).unwrap_err();
  assert!(matches!(refusal, Refusal::Drift(ref m) if m.contains("settings:link/")));
}
