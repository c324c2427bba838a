//! Workspace purging of resolved uids.

use std::collections::{BTreeMap, HashSet};

use strum::{Display, EnumString};

use super::RelationHandler;
use crate::{
  Error, Result,
  record::{VersionInfo, VersionState},
  store::RecordStore,
};

/// How versioned uids are filtered out of a resolved relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PurgeStrategy {
  /// Keep only live uids; drop workspace versions.
  LiveOnly,
  /// Drop a live uid when its version in the workspace is present too.
  PreferVersion,
  /// Drop delete placeholders of the workspace.
  DropDeletePlaceholders,
}

impl PurgeStrategy {
  /// Uids of `infos` the strategy removes.
  pub fn select(self, infos: &[VersionInfo], workspace: i64) -> HashSet<i64> {
    match self {
      Self::LiveOnly => infos.iter().filter(|i| i.is_version()).map(|i| i.uid).collect(),
      Self::PreferVersion => {
        let present: HashSet<i64> = infos.iter().map(|i| i.uid).collect();
        infos
          .iter()
          .filter(|i| i.is_version() && i.workspace == workspace && present.contains(&i.live_uid))
          .map(|i| i.live_uid)
          .collect()
      }
      Self::DropDeletePlaceholders => infos
        .iter()
        .filter(|i| i.workspace == workspace && i.state == VersionState::DeletePlaceholder)
        .map(|i| i.uid)
        .collect(),
    }
  }
}

impl<S: RecordStore> RelationHandler<'_, S> {
  /// Apply one strategy to every versioned table of the working set.
  /// Returns whether anything was removed.
  pub fn purge(&mut self, strategy: PurgeStrategy, workspace: i64) -> Result<bool> {
    let mut removed: BTreeMap<String, HashSet<i64>> = BTreeMap::new();
    for (table, ids) in &self.table_array {
      if ids.is_empty() || !self.schema.table(table).is_some_and(|t| t.versioning) {
        continue;
      }
      let infos: Vec<VersionInfo> = self
        .store
        .get_records(table, ids)
        .map_err(Error::store)?
        .iter()
        .map(|r| r.version_info())
        .collect();
      let selected = strategy.select(&infos, workspace);
      if !selected.is_empty() {
        removed.insert(table.clone(), selected);
      }
    }

    if removed.is_empty() {
      return Ok(false);
    }
    tracing::debug!(%strategy, workspace, tables = removed.len(), "purging versioned uids");
    self
      .item_array
      .retain(|item| !removed.get(&item.table).is_some_and(|ids| ids.contains(&item.uid)));
    self.rebuild_table_array();
    self.purged = true;
    Ok(true)
  }

  /// The purge appropriate for reading in `workspace`: live-only in the live
  /// workspace, otherwise prefer versions and drop delete placeholders.
  pub fn purge_item_array(&mut self, workspace: i64) -> Result<bool> {
    if workspace == 0 {
      return self.purge(PurgeStrategy::LiveOnly, 0);
    }
    let preferred = self.purge(PurgeStrategy::PreferVersion, workspace)?;
    let placeholders = self.purge(PurgeStrategy::DropDeletePlaceholders, workspace)?;
    Ok(preferred || placeholders)
  }
}
