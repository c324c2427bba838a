//! Conversions between core types and SQLite values.
//!
//! Content columns are typeless: JSON scalars map onto SQLite scalars, and
//! arrays and objects are stored as compact JSON text. Booleans become 0/1.

use refindex_core::entry::ReferenceEntry;
use rusqlite::{
  Row,
  types::{Value as SqlValue, ValueRef},
};
use serde_json::Value;

use crate::{Error, Result};

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Quote a table or column name for interpolation into SQL.
pub fn quote_ident(name: &str) -> Result<String> {
  let plain = !name.is_empty()
    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    && !name.starts_with(|c: char| c.is_ascii_digit());
  if plain {
    Ok(format!("\"{name}\""))
  } else {
    Err(Error::InvalidIdentifier(name.to_owned()))
  }
}

// ─── Column values ───────────────────────────────────────────────────────────

pub fn encode_value(value: &Value) -> Result<SqlValue> {
  Ok(match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    other => SqlValue::Text(serde_json::to_string(other)?),
  })
}

pub fn decode_value(value: ValueRef<'_>) -> Value {
  match value {
    ValueRef::Null => Value::Null,
    ValueRef::Integer(i) => Value::from(i),
    ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
    ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
  }
}

/// Text form used for equality filters, matched against `CAST(col AS TEXT)`.
pub fn filter_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Bool(b) => i64::from(*b).to_string(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

// ─── Index rows ──────────────────────────────────────────────────────────────

/// Column list matching [`decode_entry`].
pub const ENTRY_COLUMNS: &str = "hash, tablename, recuid, field, flexpointer, softref_key, \
                                 softref_id, sorting, occurrence, deleted, workspace, ref_table, \
                                 ref_uid, ref_string";

pub fn decode_entry(row: &Row<'_>) -> rusqlite::Result<ReferenceEntry> {
  Ok(ReferenceEntry {
    hash:        row.get(0)?,
    tablename:   row.get(1)?,
    recuid:      row.get(2)?,
    field:       row.get(3)?,
    flexpointer: row.get(4)?,
    softref_key: row.get(5)?,
    softref_id:  row.get(6)?,
    sorting:     row.get(7)?,
    occurrence:  row.get(8)?,
    deleted:     row.get::<_, i64>(9)? != 0,
    workspace:   row.get(10)?,
    ref_table:   row.get(11)?,
    ref_uid:     row.get(12)?,
    ref_string:  row.get(13)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn identifiers_must_be_plain() {
    assert_eq!(quote_ident("item_page_mm").unwrap(), "\"item_page_mm\"");
    assert!(quote_ident("item; DROP TABLE x").is_err());
    assert!(quote_ident("1st").is_err());
    assert!(quote_ident("").is_err());
  }

  #[test]
  fn values_survive_the_column_mapping() {
    for value in [Value::from(3), Value::from("page_5"), Value::Null] {
      let stored = encode_value(&value).unwrap();
      assert_eq!(decode_value(ValueRef::from(&stored)), value);
    }
    assert_eq!(encode_value(&Value::Bool(true)).unwrap(), SqlValue::Integer(1));
  }
}
