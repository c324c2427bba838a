//! Junction (many-to-many) tables: read, write and owner remap.

use std::collections::BTreeSet;

use super::{RelationHandler, RelationItem, ReindexHook};
use crate::{
  Error, Result,
  store::{JunctionQuery, JunctionRow, JunctionSide, RecordStore},
};

/// What [`RelationHandler::write_mm`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmWriteReport {
  pub inserted: usize,
  pub updated:  usize,
  pub deleted:  usize,
}

impl<S: RecordStore> RelationHandler<'_, S> {
  fn junction_query(&self, owner_uid: i64, owner_table: &str) -> Option<(String, JunctionQuery)> {
    let mm = self.mm.as_ref()?;
    let tablenames = (mm.side == JunctionSide::Foreign && mm.opposite_multi)
      .then(|| owner_table.to_owned());
    Some((mm.table.clone(), JunctionQuery {
      side: mm.side,
      owner_uid,
      match_fields: mm.match_fields.clone(),
      tablenames,
      with_uid: mm.has_uid,
    }))
  }

  /// Table of the related record a junction row points at.
  fn row_table(&self, row: &JunctionRow) -> Option<String> {
    let mm = self.mm.as_ref()?;
    if mm.tablenames && !row.tablenames.is_empty() {
      Some(row.tablenames.clone())
    } else {
      self.tables.first().cloned()
    }
  }

  pub(super) fn read_mm(&mut self, owner_uid: i64, owner_table: &str) -> Result<()> {
    let Some((mm, query)) = self.junction_query(owner_uid, owner_table) else {
      return Ok(());
    };
    let rows = self.store.select_junction(&mm, &query).map_err(Error::store)?;
    for row in rows {
      let uid = row.other_uid(query.side);
      match self.row_table(&row) {
        Some(table) if uid > 0 => self.push_item(RelationItem::new(table, uid)),
        _ => tracing::debug!(mm = %mm, uid, "skipping junction row without a usable target"),
      }
    }
    Ok(())
  }

  /// Persist the current item list as the junction rows of `owner_uid`.
  ///
  /// Existing rows are re-sorted in place, missing ones inserted and stale
  /// ones deleted. Records gaining or losing a row are reindexed through
  /// `hook`, followed by the owner itself.
  pub fn write_mm(
    &self,
    owner_uid: i64,
    owner_table: &str,
    hook: Option<&dyn ReindexHook>,
  ) -> Result<MmWriteReport> {
    let (Some(state), Some((mm, query))) =
      (self.mm.as_ref(), self.junction_query(owner_uid, owner_table))
    else {
      return Ok(MmWriteReport::default());
    };
    let side = state.side;

    let mut remaining = self.store.select_junction(&mm, &query).map_err(Error::store)?;
    let mut report = MmWriteReport::default();
    let mut touched: BTreeSet<RelationItem> = BTreeSet::new();

    for (position, item) in self.item_array.iter().enumerate() {
      let sorting = position as i64 + 1;
      let existing = remaining.iter().position(|row| {
        row.other_uid(side) == item.uid && (!state.tablenames || row.tablenames == item.table)
      });

      match existing {
        Some(at) => {
          let row = remaining.remove(at);
          self
            .store
            .update_junction_sorting(&mm, &row, side, sorting)
            .map_err(Error::store)?;
          report.updated += 1;
        }
        None => {
          let mut extra = state.match_fields.clone();
          extra.extend(state.insert_fields.clone());
          let row = match side {
            JunctionSide::Local => JunctionRow {
              uid_local: owner_uid,
              uid_foreign: item.uid,
              tablenames: if state.tablenames { item.table.clone() } else { String::new() },
              sorting,
              extra,
              ..Default::default()
            },
            JunctionSide::Foreign => JunctionRow {
              uid_local: item.uid,
              uid_foreign: owner_uid,
              tablenames: if state.opposite_multi { owner_table.to_owned() } else { String::new() },
              sorting_foreign: sorting,
              extra,
              ..Default::default()
            },
          };
          self.store.insert_junction(&mm, &row).map_err(Error::store)?;
          report.inserted += 1;
          touched.insert(item.clone());
        }
      }
    }

    for row in remaining {
      self.store.delete_junction(&mm, &row).map_err(Error::store)?;
      report.deleted += 1;
      if let Some(table) = self.row_table(&row) {
        touched.insert(RelationItem::new(table, row.other_uid(side)));
      }
    }

    tracing::debug!(
      mm = %mm,
      owner_table,
      owner_uid,
      inserted = report.inserted,
      updated = report.updated,
      deleted = report.deleted,
      "wrote junction rows"
    );

    if let Some(hook) = hook {
      for item in &touched {
        hook.reindex(&item.table, item.uid)?;
      }
      hook.reindex(owner_table, owner_uid)?;
    }
    Ok(report)
  }

  /// Move every junction row of `old_uid` to `new_uid` (e.g. after a copy).
  /// The caller reindexes afterwards.
  pub fn remap_mm(&self, old_uid: i64, new_uid: i64) -> Result<usize> {
    let Some(state) = self.mm.as_ref() else {
      return Ok(0);
    };
    self
      .store
      .remap_junction(&state.table, state.side, old_uid, new_uid, &state.match_fields)
      .map_err(Error::store)
  }
}
