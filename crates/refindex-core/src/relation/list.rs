//! Parsing of comma-separated relation lists.
//!
//! Tokens are either `table_id` or a bare id. Bare ids use the legacy signed
//! convention: non-negative ids belong to the first allowed table, negative
//! ids to the second one (with the sign stripped). Everything about that
//! encoding is confined to this module.

use super::RelationItem;

/// Result of [`parse_list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedList {
  pub items:     Vec<RelationItem>,
  /// Tokens that were not valid pairs, only kept when registration is on.
  pub non_table: Vec<String>,
}

/// Parse `raw` against the resolved allowed `tables`.
pub fn parse_list(raw: &str, tables: &[String], register_non_table: bool) -> ParsedList {
  let mut out = ParsedList::default();
  for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
    match parse_token(token, tables) {
      Some(item) => out.items.push(item),
      None if register_non_table => out.non_table.push(token.to_owned()),
      None => {}
    }
  }
  out
}

/// Table names may contain `_`, so the id is whatever follows the last one.
fn parse_token(token: &str, tables: &[String]) -> Option<RelationItem> {
  let (prefix, id) = match token.rfind('_') {
    Some(at) => (&token[..at], &token[at + 1..]),
    None => ("", token),
  };
  let id: i64 = id.parse().ok()?;

  if !prefix.is_empty() {
    let table = tables.iter().find(|t| *t == prefix)?;
    return (id > 0).then(|| RelationItem::new(table, id));
  }

  let (table, id) = if id < 0 {
    (tables.get(1)?, id.checked_neg()?)
  } else {
    (tables.first()?, id)
  };
  (id > 0).then(|| RelationItem::new(table, id))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tables(names: &[&str]) -> Vec<String> { names.iter().map(|s| s.to_string()).collect() }

  fn item(table: &str, uid: i64) -> RelationItem { RelationItem::new(table, uid) }

  #[test]
  fn prefixed_and_bare_tokens() {
    let t = tables(&["page", "content"]);
    let parsed = parse_list("page_5, content_9, 12", &t, false);
    assert_eq!(parsed.items, [item("page", 5), item("content", 9), item("page", 12)]);
  }

  #[test]
  fn table_names_with_underscores_split_from_the_right() {
    let t = tables(&["tt_content", "page"]);
    let parsed = parse_list("tt_content_12,page_3", &t, false);
    assert_eq!(parsed.items, [item("tt_content", 12), item("page", 3)]);
  }

  #[test]
  fn negative_bare_ids_select_the_second_table() {
    let t = tables(&["page", "content"]);
    let parsed = parse_list("-7,7", &t, false);
    assert_eq!(parsed.items, [item("content", 7), item("page", 7)]);

    // No second table: a negative id has nowhere to go.
    let single = tables(&["page"]);
    assert!(parse_list("-7", &single, false).items.is_empty());
  }

  #[test]
  fn invalid_tokens_are_dropped_or_registered() {
    let t = tables(&["page"]);
    let raw = "unknown_5,page_x,0,hello,page_-1,4";
    assert_eq!(parse_list(raw, &t, false), ParsedList { items: vec![item("page", 4)], non_table: vec![] });

    let registered = parse_list(raw, &t, true);
    assert_eq!(registered.items, [item("page", 4)]);
    assert_eq!(registered.non_table, ["unknown_5", "page_x", "0", "hello", "page_-1"]);
  }

  #[test]
  fn empty_and_whitespace_input() {
    let t = tables(&["page"]);
    assert_eq!(parse_list("", &t, true), ParsedList::default());
    assert_eq!(parse_list(" , ,", &t, true), ParsedList::default());
  }
}
