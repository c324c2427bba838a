//! The reference index: per-record diffing, whole-repository reconciliation
//! and lookups.
//!
//! Every record maps to a set of [`ReferenceEntry`] rows identified by their
//! fingerprint. Updating a record recomputes that set, keeps rows whose
//! fingerprint is still produced, inserts new ones and deletes the rest.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  fmt,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;

use crate::{
  Error, Result,
  entry::{EntryBuilder, FILE_TABLE, RefTarget, ReferenceEntry, STRING_TABLE, SoftRefCoords, Source},
  extract::{Extractor, Relations},
  relation::ReindexHook,
  schema::Schema,
  softref::SoftRefRegistry,
  store::{IndexFilter, IndexStore, RecordStore},
};

/// Registry namespace and key of the last completed reconciliation.
pub const REGISTRY_NAMESPACE: &str = "core";
pub const LAST_RUN_KEY: &str = "refindex_last_run";

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Kept,
  Added,
  Deleted,
}

/// Outcome of [`ReferenceIndex::update_ref_index_table`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
  pub kept:    usize,
  pub added:   usize,
  pub deleted: usize,
  pub entries: Vec<(Action, ReferenceEntry)>,
}

impl UpdateResult {
  pub fn has_changes(&self) -> bool { self.added > 0 || self.deleted > 0 }
}

/// Outcome of [`ReferenceIndex::update_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
  pub dry_run:          bool,
  pub tables_scanned:   usize,
  pub records_checked:  usize,
  pub kept:             usize,
  pub added:            usize,
  pub deleted:          usize,
  /// Rows of records that no longer exist.
  pub orphans_removed:  usize,
  /// Rows of tables that are no longer indexed.
  pub stale_table_rows: usize,
  pub errors:           usize,
  /// One line per record with changes or failures.
  pub messages:         Vec<String>,
}

impl fmt::Display for ReconcileReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let verb = if self.dry_run { "would be" } else { "were" };
    writeln!(
      f,
      "{} records in {} tables checked: {} kept, {} {verb} added, {} {verb} deleted",
      self.records_checked, self.tables_scanned, self.kept, self.added, self.deleted
    )?;
    writeln!(
      f,
      "{} orphaned rows and {} rows of unindexed tables {verb} removed",
      self.orphans_removed, self.stale_table_rows
    )?;
    if self.errors > 0 {
      writeln!(f, "{} records failed", self.errors)?;
    }
    for line in &self.messages {
      writeln!(f, "  {line}")?;
    }
    Ok(())
  }
}

// ─── Index ───────────────────────────────────────────────────────────────────

/// The reference index for one workspace.
pub struct ReferenceIndex<'a, S> {
  pub(crate) store:     &'a S,
  pub(crate) schema:    &'a Schema,
  pub(crate) registry:  &'a SoftRefRegistry,
  pub(crate) workspace: i64,
}

impl<'a, S: RecordStore + IndexStore> ReferenceIndex<'a, S> {
  pub fn new(store: &'a S, schema: &'a Schema, registry: &'a SoftRefRegistry) -> Self {
    Self { store, schema, registry, workspace: 0 }
  }

  pub fn with_workspace(mut self, workspace: i64) -> Self {
    self.workspace = workspace;
    self
  }

  pub fn workspace(&self) -> i64 { self.workspace }

  pub(crate) fn extractor(&self) -> Extractor<'a, S> {
    Extractor::new(self.store, self.schema, self.registry).with_workspace(self.workspace)
  }

  fn indexable(&self, table: &str) -> bool {
    self.schema.table(table).is_some_and(|t| !t.exclude_from_index)
  }

  // ── Computing entries ─────────────────────────────────────────────────

  /// The entries a record should have. `None` when the table is unknown or
  /// excluded, or the record does not exist. Soft-deleted records are
  /// indexed with their `deleted` flag set.
  pub fn generate_ref_index_data(&self, table: &str, uid: i64) -> Result<Option<Vec<ReferenceEntry>>> {
    let Some(table_schema) = self.schema.table(table).filter(|t| !t.exclude_from_index) else {
      return Ok(None);
    };
    let Some(record) = self.store.get_record(table, uid).map_err(Error::store)? else {
      return Ok(None);
    };

    let builder = EntryBuilder::new(self.schema, self.workspace);
    let deleted = record.is_deleted(table_schema);
    let workspace = record.workspace();
    let mut entries = Vec::new();

    for group in self.extractor().record(&record)? {
      let source = Source {
        table,
        uid,
        field: &group.field,
        path: &group.path,
        deleted,
        workspace,
      };
      match &group.relations {
        Relations::Db(items) => {
          let mut seen = HashMap::new();
          for (position, item) in items.iter().enumerate() {
            let target = RefTarget::Record { table: item.table.clone(), uid: item.uid };
            let occurrence = next_occurrence(&mut seen, &target);
            entries.extend(builder.build(&source, &target, position as i64, occurrence, None));
          }
        }
        Relations::Files(paths) => {
          let mut seen = HashMap::new();
          for (position, path) in paths.iter().enumerate() {
            let target = RefTarget::File { path: path.clone() };
            let occurrence = next_occurrence(&mut seen, &target);
            entries.extend(builder.build(&source, &target, position as i64, occurrence, None));
          }
        }
        Relations::SoftRefs(results) => {
          for (key, result) in results {
            for element in &result.elements {
              let coords = SoftRefCoords { key: key.as_str(), id: &element.id };
              entries.extend(builder.build(&source, &element.target, -1, 0, Some(coords)));
            }
          }
        }
      }
    }
    Ok(Some(entries))
  }

  // ── Updating ──────────────────────────────────────────────────────────

  /// Bring one record's rows in line with its current content. Kept rows
  /// whose position changed are moved in place.
  pub fn update_ref_index_table(&self, table: &str, uid: i64, dry_run: bool) -> Result<UpdateResult> {
    if !self.indexable(table) {
      tracing::debug!(table, uid, "table is not indexed; nothing to update");
      return Ok(UpdateResult::default());
    }

    let mut existing: BTreeMap<String, ReferenceEntry> = self
      .store
      .index_rows(&IndexFilter::source(table, uid, self.workspace))
      .map_err(Error::store)?
      .into_iter()
      .map(|e| (e.hash.clone(), e))
      .collect();
    let fresh = self.generate_ref_index_data(table, uid)?.unwrap_or_default();

    let mut result = UpdateResult::default();
    for entry in fresh {
      if let Some(kept) = existing.remove(&entry.hash) {
        if kept.sorting != entry.sorting && !dry_run {
          self
            .store
            .set_index_sorting(&entry.hash, entry.sorting)
            .map_err(Error::store)?;
        }
        result.kept += 1;
        result.entries.push((Action::Kept, entry));
      } else {
        if !dry_run {
          self.store.insert_index_row(&entry).map_err(Error::store)?;
        }
        result.added += 1;
        result.entries.push((Action::Added, entry));
      }
    }

    if !existing.is_empty() {
      let hashes: Vec<String> = existing.keys().cloned().collect();
      if !dry_run {
        self.store.delete_index_rows(&hashes).map_err(Error::store)?;
      }
      result.deleted = existing.len();
      result
        .entries
        .extend(existing.into_values().map(|e| (Action::Deleted, e)));
    }

    tracing::debug!(
      table,
      uid,
      workspace = self.workspace,
      kept = result.kept,
      added = result.added,
      deleted = result.deleted,
      dry_run,
      "updated reference index for record"
    );
    Ok(result)
  }

  /// Reconcile the whole repository.
  ///
  /// Every record of every indexed table is updated; failures are counted
  /// and do not stop the run. Rows of records and tables that no longer
  /// exist are removed afterwards.
  pub fn update_index(&self, dry_run: bool) -> Result<ReconcileReport> {
    let mut report = ReconcileReport { dry_run, ..Default::default() };
    let indexed: Vec<&str> = self
      .schema
      .table_names()
      .filter(|t| self.indexable(t))
      .collect();

    for table in &indexed {
      let uids = match self.store.list_uids(table) {
        Ok(uids) => uids,
        Err(e) => {
          report.errors += 1;
          report.messages.push(format!("{table}: cannot list records: {e}"));
          tracing::error!(table, error = %e, "cannot list records");
          continue;
        }
      };
      report.tables_scanned += 1;

      for &uid in &uids {
        report.records_checked += 1;
        match self.update_ref_index_table(table, uid, dry_run) {
          Ok(result) => {
            report.kept += result.kept;
            report.added += result.added;
            report.deleted += result.deleted;
            if result.has_changes() {
              report.messages.push(format!(
                "{table}:{uid}: {} added, {} deleted",
                result.added, result.deleted
              ));
            }
          }
          Err(e) => {
            report.errors += 1;
            report.messages.push(format!("{table}:{uid}: {e}"));
            tracing::error!(table, uid, error = %e, "cannot update record");
          }
        }
      }

      report.orphans_removed += self.collect_orphans(table, &uids, dry_run)?;
    }

    let indexed: BTreeSet<&str> = indexed.into_iter().collect();
    for table in self.store.index_tables().map_err(Error::store)? {
      if indexed.contains(table.as_str()) {
        continue;
      }
      let removed = if dry_run {
        self.count_rows(IndexFilter { tablename: Some(table.clone()), ..Default::default() })?
      } else {
        self.store.delete_index_rows_for_table(&table).map_err(Error::store)?
      };
      if removed > 0 {
        report.messages.push(format!("{table}: {removed} rows of an unindexed table"));
      }
      report.stale_table_rows += removed;
    }

    if !dry_run {
      let now = Utc::now().to_rfc3339();
      self
        .store
        .registry_set(REGISTRY_NAMESPACE, LAST_RUN_KEY, &now)
        .map_err(Error::store)?;
    }

    tracing::info!(
      dry_run,
      tables = report.tables_scanned,
      records = report.records_checked,
      added = report.added,
      deleted = report.deleted,
      orphans = report.orphans_removed,
      stale = report.stale_table_rows,
      errors = report.errors,
      "reference index reconciled"
    );
    Ok(report)
  }

  /// Remove rows of records of `table` that are not among `live_uids`.
  fn collect_orphans(&self, table: &str, live_uids: &[i64], dry_run: bool) -> Result<usize> {
    let live: HashSet<i64> = live_uids.iter().copied().collect();
    let mut removed = 0;
    for uid in self.store.index_uids(table).map_err(Error::store)? {
      if live.contains(&uid) {
        continue;
      }
      removed += if dry_run {
        self.count_rows(IndexFilter {
          tablename: Some(table.to_owned()),
          recuid: Some(uid),
          ..Default::default()
        })?
      } else {
        self
          .store
          .delete_index_rows_for_record(table, uid)
          .map_err(Error::store)?
      };
      tracing::debug!(table, uid, dry_run, "removing rows of a missing record");
    }
    Ok(removed)
  }

  fn count_rows(&self, filter: IndexFilter) -> Result<usize> {
    Ok(self.store.index_rows(&filter).map_err(Error::store)?.len())
  }

  // ── Queries ───────────────────────────────────────────────────────────

  /// Rows pointing at a record.
  pub fn references_to(&self, table: &str, uid: i64) -> Result<Vec<ReferenceEntry>> {
    let filter = IndexFilter { workspace: Some(self.workspace), ..IndexFilter::target(table, uid) };
    self.store.index_rows(&filter).map_err(Error::store)
  }

  /// Rows pointing at a file path.
  pub fn references_to_file(&self, path: &str) -> Result<Vec<ReferenceEntry>> {
    let filter = IndexFilter {
      workspace: Some(self.workspace),
      ref_table: Some(FILE_TABLE.to_owned()),
      ref_string: Some(path.to_owned()),
      ..Default::default()
    };
    self.store.index_rows(&filter).map_err(Error::store)
  }

  /// References to a record held by records that are not soft-deleted.
  pub fn count_references_to(&self, table: &str, uid: i64) -> Result<usize> {
    Ok(self.references_to(table, uid)?.iter().filter(|e| !e.deleted).count())
  }

  /// Rows whose record target does not exist: the target table is unknown
  /// or the target row is gone.
  pub fn lost_references(&self) -> Result<Vec<ReferenceEntry>> {
    let rows = self
      .store
      .index_rows(&IndexFilter { workspace: Some(self.workspace), ..Default::default() })
      .map_err(Error::store)?;

    let mut targets: BTreeMap<&str, BTreeSet<i64>> = BTreeMap::new();
    for row in &rows {
      if row.ref_table != FILE_TABLE && row.ref_table != STRING_TABLE {
        targets.entry(row.ref_table.as_str()).or_default().insert(row.ref_uid);
      }
    }

    let mut present: HashSet<(String, i64)> = HashSet::new();
    for (table, uids) in &targets {
      if !self.schema.contains(table) {
        continue;
      }
      let uids: Vec<i64> = uids.iter().copied().collect();
      for record in self.store.get_records(table, &uids).map_err(Error::store)? {
        present.insert((record.table, record.uid));
      }
    }

    Ok(
      rows
        .into_iter()
        .filter(|r| r.ref_table != FILE_TABLE && r.ref_table != STRING_TABLE)
        .filter(|r| !present.contains(&(r.ref_table.clone(), r.ref_uid)))
        .collect(),
    )
  }

  /// When the last non-dry reconciliation finished.
  pub fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = self
      .store
      .registry_get(REGISTRY_NAMESPACE, LAST_RUN_KEY)
      .map_err(Error::store)?
    else {
      return Ok(None);
    };
    match DateTime::parse_from_rfc3339(&raw) {
      Ok(at) => Ok(Some(at.with_timezone(&Utc))),
      Err(e) => {
        tracing::warn!(value = %raw, error = %e, "unreadable last-run timestamp");
        Ok(None)
      }
    }
  }
}

/// Ordinal of `target` among the identical targets seen so far.
fn next_occurrence(seen: &mut HashMap<RefTarget, i64>, target: &RefTarget) -> i64 {
  let count = seen.entry(target.clone()).or_insert(0);
  let occurrence = *count;
  *count += 1;
  occurrence
}

impl<S: RecordStore + IndexStore> ReindexHook for ReferenceIndex<'_, S> {
  fn reindex(&self, table: &str, uid: i64) -> Result<()> {
    self.update_ref_index_table(table, uid, false).map(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn report_summarizes_dry_runs_conditionally() {
    let report = ReconcileReport {
      dry_run: true,
      tables_scanned: 2,
      records_checked: 5,
      added: 1,
      messages: vec!["item:1: 1 added, 0 deleted".into()],
      ..Default::default()
    };
    let text = report.to_string();
    assert!(text.starts_with("5 records in 2 tables checked: 0 kept, 1 would be added"));
    assert!(text.contains("  item:1: 1 added, 0 deleted"));
    assert!(!text.contains("failed"));
  }

  #[test]
  fn actions_display_lowercase() {
    assert_eq!(Action::Deleted.to_string(), "deleted");
  }
}
