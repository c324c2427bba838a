//! Traversal of nested (JSON tree) fields.
//!
//! A nested field stores a JSON document. Leaves are configured by the key
//! that holds them, so the same leaf configuration applies wherever the key
//! appears. Each configured leaf is reported with its tree path: the keys
//! (or array indices) from the root down to and including the leaf, joined
//! by `/` with a trailing `/`, e.g. `settings/links/0/target/`.

use serde_json::Value;

use crate::schema::{FieldConfig, NestedConfig};

/// One configured leaf of a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeLeaf<'c> {
  pub path:   String,
  pub key:    String,
  pub config: &'c FieldConfig,
  /// The leaf rendered as text; scalar arrays are joined with `,`.
  pub raw:    String,
}

/// Read a stored nested field: either a JSON document already, or text
/// holding one. Empty and unparsable text yield `None`.
pub fn parse(value: Option<&Value>) -> Option<Value> {
  match value? {
    Value::String(s) if s.trim().is_empty() => None,
    Value::String(s) => match serde_json::from_str::<Value>(s) {
      Ok(tree) => Some(tree),
      Err(e) => {
        tracing::debug!(error = %e, "nested field does not hold JSON");
        None
      }
    },
    Value::Null => None,
    other => Some(other.clone()),
  }
}

/// Every configured leaf of `tree`, in key order. Each subtree is walked on
/// its own and the results concatenated.
pub fn walk<'c>(tree: &Value, config: &'c NestedConfig) -> Vec<TreeLeaf<'c>> {
  walk_at(tree, config, "")
}

fn walk_at<'c>(value: &Value, config: &'c NestedConfig, prefix: &str) -> Vec<TreeLeaf<'c>> {
  let children: Vec<(String, &Value)> = match value {
    Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
    Value::Array(items) => items
      .iter()
      .enumerate()
      .map(|(i, v)| (i.to_string(), v))
      .collect(),
    _ => return Vec::new(),
  };

  children
    .into_iter()
    .flat_map(|(key, child)| {
      let path = format!("{prefix}{key}/");
      match config.fields.get(&key) {
        Some(FieldConfig::Nested(inner)) => walk_at(child, inner, &path),
        Some(FieldConfig::Plain) => Vec::new(),
        Some(leaf) => leaf_text(child)
          .map(|raw| TreeLeaf { path, key, config: leaf, raw })
          .into_iter()
          .collect(),
        None => walk_at(child, config, &path),
      }
    })
    .collect()
}

fn leaf_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Array(items) => {
      let parts: Option<Vec<String>> = items
        .iter()
        .map(|v| match v {
          Value::String(s) => Some(s.clone()),
          Value::Number(n) => Some(n.to_string()),
          _ => None,
        })
        .collect();
      parts.map(|p| p.join(","))
    }
    _ => None,
  }
}

/// The node at `path`, if any.
pub fn leaf<'t>(tree: &'t Value, path: &str) -> Option<&'t Value> {
  let mut node = tree;
  for segment in path.split('/').filter(|s| !s.is_empty()) {
    node = match node {
      Value::Object(map) => map.get(segment)?,
      Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
      _ => return None,
    };
  }
  Some(node)
}

/// Leaf text rendered back in the shape of `original`: arrays are split on
/// `,` (numbers stay numbers), numbers stay numbers when the text parses.
pub fn leaf_value(original: &Value, text: &str) -> Value {
  match original {
    Value::Array(items) => {
      let numeric = !items.is_empty() && items.iter().all(Value::is_number);
      Value::Array(
        text
          .split(',')
          .map(str::trim)
          .filter(|s| !s.is_empty())
          .map(|s| match s.parse::<i64>() {
            Ok(n) if numeric => Value::from(n),
            _ => Value::from(s),
          })
          .collect(),
      )
    }
    Value::Number(_) => text.trim().parse::<i64>().map_or_else(|_| Value::from(text), Value::from),
    _ => Value::from(text),
  }
}

/// Replace the value at `path`. Returns `false` when the path does not lead
/// to an existing node.
pub fn set_leaf(tree: &mut Value, path: &str, new: Value) -> bool {
  let mut node = tree;
  for segment in path.split('/').filter(|s| !s.is_empty()) {
    let next = match node {
      Value::Object(map) => map.get_mut(segment),
      Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
      _ => None,
    };
    match next {
      Some(child) => node = child,
      None => return false,
    }
  }
  *node = new;
  true
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use serde_json::json;

  use super::*;
  use crate::schema::{RelationConfig, SoftRefConfig};

  fn config() -> NestedConfig {
    NestedConfig {
      fields: BTreeMap::from([
        ("link".to_owned(), FieldConfig::Relation(RelationConfig::new("page"))),
        ("note".to_owned(), FieldConfig::SoftReference(SoftRefConfig {
          recognizers: vec!["email".into()],
        })),
        ("title".to_owned(), FieldConfig::Plain),
      ]),
    }
  }

  #[test]
  fn walk_reports_configured_leaves_with_paths() {
    let tree = json!({
      "settings": { "link": "page_5", "title": "ignored" },
      "slides": [ { "link": ["page_1", "page_2"] }, { "note": "a@example.com" } ]
    });
    let cfg = config();
    let leaves = walk(&tree, &cfg);
    let found: Vec<(&str, &str)> =
      leaves.iter().map(|l| (l.path.as_str(), l.raw.as_str())).collect();
    assert_eq!(found, [
      ("settings/link/", "page_5"),
      ("slides/0/link/", "page_1,page_2"),
      ("slides/1/note/", "a@example.com"),
    ]);
  }

  #[test]
  fn parse_accepts_text_and_documents() {
    assert_eq!(parse(Some(&json!("{\"a\":1}"))), Some(json!({ "a": 1 })));
    assert_eq!(parse(Some(&json!({ "a": 1 }))), Some(json!({ "a": 1 })));
    assert_eq!(parse(Some(&json!("not json"))), None);
    assert_eq!(parse(Some(&json!(""))), None);
    assert_eq!(parse(None), None);
  }

  #[test]
  fn set_leaf_follows_objects_and_arrays() {
    let mut tree = json!({ "slides": [ { "link": "page_1" } ] });
    assert!(set_leaf(&mut tree, "slides/0/link/", json!("page_2")));
    assert_eq!(tree, json!({ "slides": [ { "link": "page_2" } ] }));
    assert!(!set_leaf(&mut tree, "slides/3/link/", json!("x")));
  }

  #[test]
  fn leaf_values_keep_their_shape() {
    let tree = json!({ "a": [{ "ids": [5, 9] }], "s": "page_1" });
    assert_eq!(leaf(&tree, "a/0/ids/"), Some(&json!([5, 9])));
    assert_eq!(leaf(&tree, "a/1/ids/"), None);

    assert_eq!(leaf_value(&json!([5, 9]), "9,7"), json!([9, 7]));
    assert_eq!(leaf_value(&json!(["page_1", "page_2"]), "page_2"), json!(["page_2"]));
    assert_eq!(leaf_value(&json!(["page_1"]), ""), json!([]));
    assert_eq!(leaf_value(&json!(5), "7"), json!(7));
    assert_eq!(leaf_value(&json!("page_1"), "9"), json!("9"));
  }
}
