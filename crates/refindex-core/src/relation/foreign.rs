//! Child rows keyed by a parent pointer (`foreign_field`), optionally
//! bidirectional through `symmetric_field`.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{RelationHandler, RelationItem, ReindexHook, SortKey, SortOrder};
use crate::{
  Error, Result,
  record::{Record, VersionState},
  store::{RecordStore, RowFilter},
};

impl<S: RecordStore> RelationHandler<'_, S> {
  pub(super) fn read_foreign_field(&mut self, owner_uid: i64, owner_table: &str) -> Result<()> {
    let Some(child_table) = self.tables.first().cloned() else {
      return Ok(());
    };
    let Some(foreign_field) = self.config.foreign_field.clone() else {
      return Ok(());
    };

    let filter = self.child_filter(&foreign_field, owner_uid, owner_table, true);
    let rows = self
      .store
      .select_rows(&child_table, &filter)
      .map_err(Error::store)?;

    let mut children: Vec<(SortKey, bool, i64)> = rows
      .iter()
      .filter(|row| self.child_is_eligible(&child_table, row))
      .map(|row| {
        let order = self.child_sort_order(&child_table, row, &foreign_field, owner_uid);
        let key = order.map(|o| SortKey::of(row, o.column)).unwrap_or(SortKey::Missing);
        let descending = order.is_some_and(|o| o.descending);
        (key, descending, row.uid)
      })
      .collect();

    children.sort_by(|(ka, desc, ua), (kb, _, ub)| {
      let ord = ka.cmp(kb);
      let ord = if *desc { ord.reverse() } else { ord };
      ord.then(ua.cmp(ub))
    });

    for (_, _, uid) in children {
      self.push_item(RelationItem::new(child_table.clone(), uid));
    }
    Ok(())
  }

  fn child_filter(
    &self,
    foreign_field: &str,
    owner_uid: i64,
    owner_table: &str,
    with_symmetric: bool,
  ) -> RowFilter {
    let mut filter = RowFilter::default();
    filter.any_of.push((foreign_field.to_owned(), Value::from(owner_uid)));
    if let Some(symmetric) = self.config.symmetric_field.as_ref().filter(|_| with_symmetric) {
      filter.any_of.push((symmetric.clone(), Value::from(owner_uid)));
    }
    if let Some(table_field) = &self.config.foreign_table_field {
      filter.all_of.push((table_field.clone(), Value::from(owner_table)));
    }
    for (column, value) in &self.config.foreign_match_fields {
      filter.all_of.push((column.clone(), Value::from(value.as_str())));
    }
    filter
  }

  /// Soft-deleted rows never qualify. In versioned tables only live rows and
  /// rows of the handler's workspace do, minus delete placeholders unless
  /// requested.
  fn child_is_eligible(&self, child_table: &str, row: &Record) -> bool {
    let Some(schema) = self.schema.table(child_table) else {
      return false;
    };
    if row.is_deleted(schema) {
      return false;
    }
    if schema.versioning {
      let info = row.version_info();
      if info.workspace != 0 && info.workspace != self.workspace {
        return false;
      }
      if info.state == VersionState::DeletePlaceholder && !self.include_delete_placeholders {
        return false;
      }
    }
    true
  }

  /// The sort column of one child.
  ///
  /// Symmetric relations sort rows reached through the symmetric pointer by
  /// `symmetric_sortby` and all others by `foreign_sortby`. Then the chain
  /// `foreign_sortby`, `foreign_default_sortby`, the child table's
  /// `sort_field`, the child table's `default_sort_by` applies.
  fn child_sort_order<'c>(
    &'c self,
    child_table: &str,
    row: &Record,
    foreign_field: &str,
    owner_uid: i64,
  ) -> Option<SortOrder<'c>> {
    let cfg = &self.config;
    if let Some(symmetric) = cfg.symmetric_field.as_deref() {
      let via_symmetric = row.int(symmetric) == owner_uid && row.int(foreign_field) != owner_uid;
      let per_side = if via_symmetric {
        cfg.symmetric_sortby.as_deref()
      } else {
        cfg.foreign_sortby.as_deref()
      };
      if let Some(column) = per_side {
        return Some(SortOrder::parse(column));
      }
    }

    let table = self.schema.table(child_table);
    cfg
      .foreign_sortby
      .as_deref()
      .or(cfg.foreign_default_sortby.as_deref())
      .or_else(|| table.and_then(|t| t.sort_field.as_deref()))
      .or_else(|| table.and_then(|t| t.default_sort_by.as_deref()))
      .map(SortOrder::parse)
  }

  /// Point every child in the item list at `owner_uid` and persist its
  /// position. Children reached through the symmetric pointer only get their
  /// symmetric sort column updated. Visible children that point at the owner
  /// but are no longer listed are detached by resetting their parent pointer
  /// to 0.
  pub fn write_foreign_field(
    &self,
    owner_uid: i64,
    owner_table: &str,
    hook: Option<&dyn ReindexHook>,
  ) -> Result<usize> {
    let Some(foreign_field) = self.config.foreign_field.as_deref() else {
      return Ok(0);
    };
    let mut written = 0;

    for (position, item) in self.item_array.iter().enumerate() {
      let sorting = Value::from(position as i64 + 1);
      let Some(child) = self
        .store
        .get_record(&item.table, item.uid)
        .map_err(Error::store)?
      else {
        continue;
      };

      let mut values: BTreeMap<String, Value> = BTreeMap::new();
      let via_symmetric = self
        .config
        .symmetric_field
        .as_deref()
        .is_some_and(|s| child.int(s) == owner_uid && child.int(foreign_field) != owner_uid);

      if via_symmetric {
        if let Some(column) = &self.config.symmetric_sortby {
          values.insert(column.clone(), sorting);
        }
      } else {
        values.insert(foreign_field.to_owned(), Value::from(owner_uid));
        if let Some(table_field) = &self.config.foreign_table_field {
          values.insert(table_field.clone(), Value::from(owner_table));
        }
        for (column, value) in &self.config.foreign_match_fields {
          values.insert(column.clone(), Value::from(value.as_str()));
        }
        let sort_column = self.config.foreign_sortby.as_deref().or_else(|| {
          self
            .schema
            .table(&item.table)
            .and_then(|t| t.sort_field.as_deref())
        });
        if let Some(column) = sort_column {
          values.insert(SortOrder::parse(column).column.to_owned(), sorting);
        }
      }

      if values.is_empty() {
        continue;
      }
      self
        .store
        .update_fields(&item.table, item.uid, &values)
        .map_err(Error::store)?;
      written += 1;
      if let Some(hook) = hook {
        hook.reindex(&item.table, item.uid)?;
      }
    }

    if let Some(child_table) = self.tables.first() {
      let filter = self.child_filter(foreign_field, owner_uid, owner_table, false);
      let current = self
        .store
        .select_rows(child_table, &filter)
        .map_err(Error::store)?;
      for child in current.iter().filter(|row| self.child_is_eligible(child_table, row)) {
        let listed = self
          .item_array
          .iter()
          .any(|i| i.table == *child_table && i.uid == child.uid);
        if listed {
          continue;
        }
        let values = BTreeMap::from([(foreign_field.to_owned(), Value::from(0))]);
        self
          .store
          .update_fields(child_table, child.uid, &values)
          .map_err(Error::store)?;
        written += 1;
        tracing::debug!(table = %child_table, uid = child.uid, owner_uid, "detached child");
        if let Some(hook) = hook {
          hook.reindex(child_table, child.uid)?;
        }
      }
    }

    if let Some(hook) = hook {
      hook.reindex(owner_table, owner_uid)?;
    }
    Ok(written)
  }
}
