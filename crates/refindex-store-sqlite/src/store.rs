//! [`SqliteStore`]: the SQLite implementation of [`RecordStore`] and
//! [`IndexStore`].

use std::{
  collections::{BTreeMap, BTreeSet},
  path::Path,
};

use refindex_core::{
  entry::ReferenceEntry,
  record::{Record, UID_FIELD, WS_ID_FIELD, WS_ORIGIN_FIELD, WS_STATE_FIELD},
  schema::{FieldConfig, Schema},
  store::{
    IndexFilter, IndexStore, JunctionQuery, JunctionRow, JunctionSide, RecordStore, RowFilter,
  },
};
use rusqlite::{
  Connection, OptionalExtension as _, params, params_from_iter,
  types::{FromSql, Value as SqlValue},
};
use serde_json::Value;

use crate::{
  Error, Result,
  encode::{ENTRY_COLUMNS, decode_entry, decode_value, encode_value, filter_text, quote_ident},
  schema::{JUNCTION_COLUMNS, SCHEMA},
};

/// Bound parameters per `IN (...)` list.
const CHUNK: usize = 500;

// ─── Store ───────────────────────────────────────────────────────────────────

/// Content repository and reference index in one SQLite database.
pub struct SqliteStore {
  conn: Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and create the index tables.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let store = Self { conn: Connection::open(path)? };
    store.init_schema()?;
    tracing::info!(path = %path.display(), "opened store");
    Ok(store)
  }

  /// Open an in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let store = Self { conn: Connection::open_in_memory()? };
    store.init_schema()?;
    Ok(store)
  }

  fn init_schema(&self) -> Result<()> {
    self.conn.execute_batch(SCHEMA)?;
    // Indexes written before occurrences were tracked.
    if !self.columns("sys_refindex")?.contains("occurrence") {
      self.conn.execute(
        "ALTER TABLE sys_refindex ADD COLUMN occurrence INTEGER NOT NULL DEFAULT 0",
        [],
      )?;
      tracing::info!("added occurrence column to sys_refindex");
    }
    Ok(())
  }

  /// Create every content and junction table the schema mentions, and add
  /// missing columns to existing ones. Columns are typeless.
  pub fn ensure_schema(&self, schema: &Schema) -> Result<()> {
    let mut tables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut junctions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (name, table) in &schema.tables {
      let columns = tables.entry(name.clone()).or_default();
      columns.extend(table.delete_field.iter().cloned());
      columns.extend(table.sort_field.iter().cloned());
      columns.extend(table.default_sort_by.as_deref().and_then(sort_column).map(str::to_owned));
      if table.versioning {
        columns.extend([WS_ID_FIELD, WS_ORIGIN_FIELD, WS_STATE_FIELD].map(str::to_owned));
      }
      columns.extend(table.fields.keys().cloned());
    }

    // Relation metadata names columns of other tables.
    let mut foreign_columns: Vec<(String, String)> = Vec::new();
    for table in schema.tables.values() {
      for config in table.fields.values() {
        let FieldConfig::Relation(rc) = config else {
          continue;
        };
        if let Some(mm) = &rc.mm {
          junctions
            .entry(mm.clone())
            .or_default()
            .extend(rc.mm_match_fields.keys().chain(rc.mm_insert_fields.keys()).cloned());
        }
        if rc.foreign_field.is_some() {
          let columns: Vec<String> = [
            rc.foreign_field.as_deref(),
            rc.foreign_table_field.as_deref(),
            rc.symmetric_field.as_deref(),
            rc.foreign_sortby.as_deref().and_then(sort_column),
            rc.symmetric_sortby.as_deref().and_then(sort_column),
            rc.foreign_default_sortby.as_deref().and_then(sort_column),
          ]
          .into_iter()
          .flatten()
          .map(str::to_owned)
          .chain(rc.foreign_match_fields.keys().cloned())
          .collect();
          for child in schema.resolve_allowed(&rc.allowed) {
            foreign_columns.extend(columns.iter().map(|c| (child.clone(), c.clone())));
          }
        }
      }
    }
    for (table, column) in foreign_columns {
      tables.entry(table).or_default().insert(column);
    }

    for (table, columns) in &tables {
      self.create_content_table(table)?;
      self.ensure_columns(table, columns.iter().map(String::as_str))?;
    }
    for (mm, columns) in &junctions {
      self.create_junction_table(mm)?;
      self.ensure_columns(mm, columns.iter().map(String::as_str))?;
    }

    tracing::info!(tables = tables.len(), junctions = junctions.len(), "content schema ensured");
    Ok(())
  }

  /// Insert a record, adding columns as needed. A record with `uid <= 0`
  /// gets the next free uid. Returns the uid.
  pub fn insert_record(&self, record: &Record) -> Result<i64> {
    self.create_content_table(&record.table)?;
    let fields: Vec<(&String, &Value)> =
      record.fields.iter().filter(|(k, _)| k.as_str() != UID_FIELD).collect();
    self.ensure_columns(&record.table, fields.iter().map(|(k, _)| k.as_str()))?;

    let mut columns = Vec::new();
    let mut values = Vec::new();
    if record.uid > 0 {
      columns.push(UID_FIELD.to_owned());
      values.push(SqlValue::Integer(record.uid));
    }
    for (name, value) in fields {
      columns.push(quote_ident(name)?);
      values.push(encode_value(value)?);
    }

    let table = quote_ident(&record.table)?;
    if columns.is_empty() {
      self.conn.execute(&format!("INSERT INTO {table} DEFAULT VALUES"), [])?;
    } else {
      let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        placeholders(columns.len())
      );
      self.conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(if record.uid > 0 { record.uid } else { self.conn.last_insert_rowid() })
  }

  /// Hard-delete a record. Returns whether a row was removed.
  pub fn delete_record(&self, table: &str, uid: i64) -> Result<bool> {
    if !self.table_exists(table)? {
      return Ok(false);
    }
    let sql = format!("DELETE FROM {} WHERE uid = ?1", quote_ident(table)?);
    Ok(self.conn.execute(&sql, params![uid])? > 0)
  }

  /// Drop a whole content table.
  pub fn drop_table(&self, table: &str) -> Result<()> {
    self.conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)?), [])?;
    Ok(())
  }

  // ── Helpers ───────────────────────────────────────────────────────────

  fn create_content_table(&self, table: &str) -> Result<()> {
    let sql = format!("CREATE TABLE IF NOT EXISTS {} (uid INTEGER PRIMARY KEY)", quote_ident(table)?);
    self.conn.execute(&sql, [])?;
    Ok(())
  }

  fn create_junction_table(&self, mm: &str) -> Result<()> {
    let sql = format!(
      "CREATE TABLE IF NOT EXISTS {} (uid INTEGER PRIMARY KEY, {JUNCTION_COLUMNS})",
      quote_ident(mm)?
    );
    self.conn.execute(&sql, [])?;
    Ok(())
  }

  fn table_exists(&self, table: &str) -> Result<bool> {
    Ok(
      self
        .conn
        .query_row(
          "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
          params![table],
          |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false),
    )
  }

  fn columns(&self, table: &str) -> Result<BTreeSet<String>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
    let mut stmt = self.conn.prepare(&sql)?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    Ok(names.collect::<rusqlite::Result<_>>()?)
  }

  fn ensure_columns<'c>(&self, table: &str, wanted: impl IntoIterator<Item = &'c str>) -> Result<()> {
    let existing = self.columns(table)?;
    let quoted = quote_ident(table)?;
    for column in wanted {
      if column == UID_FIELD || existing.contains(column) {
        continue;
      }
      self
        .conn
        .execute(&format!("ALTER TABLE {quoted} ADD COLUMN {}", quote_ident(column)?), [])?;
      tracing::debug!(table, column, "added column");
    }
    Ok(())
  }

  fn query_column<T, C>(&self, sql: &str, params: Vec<SqlValue>) -> Result<C>
  where
    T: FromSql,
    C: FromIterator<T>,
  {
    let mut stmt = self.conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, T>(0))?;
    Ok(rows.collect::<rusqlite::Result<C>>()?)
  }

  fn query_records(&self, table: &str, clause: &str, params: Vec<SqlValue>) -> Result<Vec<Record>> {
    let sql = format!("SELECT * FROM {} {clause} ORDER BY uid", quote_ident(table)?);
    let mut stmt = self.conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
    let rows = stmt.query_map(params_from_iter(params), |row| {
      let mut record = Record::new(table, 0);
      for (i, name) in names.iter().enumerate() {
        if name == UID_FIELD {
          record.uid = row.get(i)?;
        } else {
          record.fields.insert(name.clone(), decode_value(row.get_ref(i)?));
        }
      }
      Ok(record)
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
  }

  /// `WHERE` clause identifying one junction row.
  fn junction_key(&self, row: &JunctionRow) -> Result<(String, Vec<SqlValue>)> {
    if let Some(uid) = row.uid {
      return Ok(("uid = ?".to_owned(), vec![SqlValue::Integer(uid)]));
    }
    let mut clause =
      String::from("uid_local = ? AND uid_foreign = ? AND COALESCE(tablenames, '') = ?");
    let mut params = vec![
      SqlValue::Integer(row.uid_local),
      SqlValue::Integer(row.uid_foreign),
      SqlValue::Text(row.tablenames.clone()),
    ];
    for (column, value) in &row.extra {
      clause.push_str(&format!(" AND CAST({} AS TEXT) = ?", quote_ident(column)?));
      params.push(SqlValue::Text(value.clone()));
    }
    Ok((clause, params))
  }
}

fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

/// Column of a sort declaration such as `crdate DESC`.
fn sort_column(spec: &str) -> Option<&str> { spec.split_whitespace().next() }

// ─── RecordStore ─────────────────────────────────────────────────────────────

impl RecordStore for SqliteStore {
  type Error = Error;

  fn get_record(&self, table: &str, uid: i64) -> Result<Option<Record>> {
    if !self.table_exists(table)? {
      return Ok(None);
    }
    let mut rows = self.query_records(table, "WHERE uid = ?", vec![SqlValue::Integer(uid)])?;
    Ok(rows.pop())
  }

  fn get_records(&self, table: &str, uids: &[i64]) -> Result<Vec<Record>> {
    if uids.is_empty() || !self.table_exists(table)? {
      return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(CHUNK) {
      let clause = format!("WHERE uid IN ({})", placeholders(chunk.len()));
      let params = chunk.iter().map(|u| SqlValue::Integer(*u)).collect();
      out.extend(self.query_records(table, &clause, params)?);
    }
    Ok(out)
  }

  fn list_uids(&self, table: &str) -> Result<Vec<i64>> {
    if !self.table_exists(table)? {
      return Ok(Vec::new());
    }
    let sql = format!("SELECT uid FROM {} ORDER BY uid", quote_ident(table)?);
    self.query_column(&sql, Vec::new())
  }

  fn select_rows(&self, table: &str, filter: &RowFilter) -> Result<Vec<Record>> {
    if !self.table_exists(table)? {
      return Ok(Vec::new());
    }
    let columns = self.columns(table)?;
    // A missing column never matches.
    if filter.all_of.iter().any(|(c, _)| !columns.contains(c)) {
      return Ok(Vec::new());
    }
    let any_of: Vec<&(String, Value)> =
      filter.any_of.iter().filter(|(c, _)| columns.contains(c)).collect();
    if !filter.any_of.is_empty() && any_of.is_empty() {
      return Ok(Vec::new());
    }

    let mut conditions = Vec::new();
    let mut params = Vec::new();
    if !any_of.is_empty() {
      let mut alternatives = Vec::new();
      for (column, value) in any_of {
        alternatives.push(format!("CAST({} AS TEXT) = ?", quote_ident(column)?));
        params.push(SqlValue::Text(filter_text(value)));
      }
      conditions.push(format!("({})", alternatives.join(" OR ")));
    }
    for (column, value) in &filter.all_of {
      conditions.push(format!("CAST({} AS TEXT) = ?", quote_ident(column)?));
      params.push(SqlValue::Text(filter_text(value)));
    }

    let clause = if conditions.is_empty() {
      String::new()
    } else {
      format!("WHERE {}", conditions.join(" AND "))
    };
    self.query_records(table, &clause, params)
  }

  fn update_fields(&self, table: &str, uid: i64, values: &BTreeMap<String, Value>) -> Result<()> {
    if values.is_empty() || !self.table_exists(table)? {
      return Ok(());
    }
    self.ensure_columns(table, values.keys().map(String::as_str))?;
    let mut assignments = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len() + 1);
    for (column, value) in values {
      assignments.push(format!("{} = ?", quote_ident(column)?));
      params.push(encode_value(value)?);
    }
    params.push(SqlValue::Integer(uid));
    let sql = format!(
      "UPDATE {} SET {} WHERE uid = ?",
      quote_ident(table)?,
      assignments.join(", ")
    );
    self.conn.execute(&sql, params_from_iter(params))?;
    Ok(())
  }

  // ── Junction tables ───────────────────────────────────────────────────

  fn select_junction(&self, mm: &str, query: &JunctionQuery) -> Result<Vec<JunctionRow>> {
    if !self.table_exists(mm)? {
      return Ok(Vec::new());
    }
    let columns = self.columns(mm)?;
    if query.match_fields.keys().any(|c| !columns.contains(c)) {
      return Ok(Vec::new());
    }

    let side = query.side;
    let uid_column = if query.with_uid && columns.contains(UID_FIELD) { UID_FIELD } else { "NULL" };
    let mut select = format!(
      "SELECT {uid_column}, uid_local, uid_foreign, COALESCE(tablenames, ''), \
       COALESCE(sorting, 0), COALESCE(sorting_foreign, 0)"
    );
    let mut clause = format!("WHERE {} = ?", side.owner_column());
    let mut params = vec![SqlValue::Integer(query.owner_uid)];
    for (column, value) in &query.match_fields {
      let quoted = quote_ident(column)?;
      select.push_str(&format!(", COALESCE(CAST({quoted} AS TEXT), '')"));
      clause.push_str(&format!(" AND CAST({quoted} AS TEXT) = ?"));
      params.push(SqlValue::Text(value.clone()));
    }
    if let Some(tablenames) = &query.tablenames {
      clause.push_str(" AND COALESCE(tablenames, '') = ?");
      params.push(SqlValue::Text(tablenames.clone()));
    }
    let sql = format!(
      "{select} FROM {} {clause} ORDER BY {}, rowid",
      quote_ident(mm)?,
      side.sort_column()
    );

    let keys: Vec<&String> = query.match_fields.keys().collect();
    let mut stmt = self.conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| {
      let mut extra = BTreeMap::new();
      for (i, key) in keys.iter().enumerate() {
        extra.insert((*key).clone(), row.get::<_, String>(6 + i)?);
      }
      Ok(JunctionRow {
        uid: row.get(0)?,
        uid_local: row.get(1)?,
        uid_foreign: row.get(2)?,
        tablenames: row.get(3)?,
        sorting: row.get(4)?,
        sorting_foreign: row.get(5)?,
        extra,
      })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
  }

  fn insert_junction(&self, mm: &str, row: &JunctionRow) -> Result<()> {
    self.create_junction_table(mm)?;
    self.ensure_columns(mm, row.extra.keys().map(String::as_str))?;

    let mut columns: Vec<String> =
      ["uid_local", "uid_foreign", "tablenames", "sorting", "sorting_foreign"]
        .map(str::to_owned)
        .to_vec();
    let mut params = vec![
      SqlValue::Integer(row.uid_local),
      SqlValue::Integer(row.uid_foreign),
      SqlValue::Text(row.tablenames.clone()),
      SqlValue::Integer(row.sorting),
      SqlValue::Integer(row.sorting_foreign),
    ];
    for (column, value) in &row.extra {
      columns.push(quote_ident(column)?);
      params.push(SqlValue::Text(value.clone()));
    }
    let sql = format!(
      "INSERT INTO {} ({}) VALUES ({})",
      quote_ident(mm)?,
      columns.join(", "),
      placeholders(columns.len())
    );
    self.conn.execute(&sql, params_from_iter(params))?;
    Ok(())
  }

  fn update_junction_sorting(
    &self,
    mm: &str,
    row: &JunctionRow,
    side: JunctionSide,
    sorting: i64,
  ) -> Result<()> {
    let (clause, key) = self.junction_key(row)?;
    let sql = format!(
      "UPDATE {} SET {} = ? WHERE {clause}",
      quote_ident(mm)?,
      side.sort_column()
    );
    let params = std::iter::once(SqlValue::Integer(sorting)).chain(key);
    self.conn.execute(&sql, params_from_iter(params))?;
    Ok(())
  }

  fn delete_junction(&self, mm: &str, row: &JunctionRow) -> Result<()> {
    let (clause, key) = self.junction_key(row)?;
    let sql = format!("DELETE FROM {} WHERE {clause}", quote_ident(mm)?);
    self.conn.execute(&sql, params_from_iter(key))?;
    Ok(())
  }

  fn remap_junction(
    &self,
    mm: &str,
    side: JunctionSide,
    old_uid: i64,
    new_uid: i64,
    match_fields: &BTreeMap<String, String>,
  ) -> Result<usize> {
    if !self.table_exists(mm)? {
      return Ok(0);
    }
    let columns = self.columns(mm)?;
    if match_fields.keys().any(|c| !columns.contains(c)) {
      return Ok(0);
    }
    let owner = side.owner_column();
    let mut clause = format!("{owner} = ?");
    let mut params = vec![SqlValue::Integer(new_uid), SqlValue::Integer(old_uid)];
    for (column, value) in match_fields {
      clause.push_str(&format!(" AND CAST({} AS TEXT) = ?", quote_ident(column)?));
      params.push(SqlValue::Text(value.clone()));
    }
    let sql = format!("UPDATE {} SET {owner} = ? WHERE {clause}", quote_ident(mm)?);
    let changed = self.conn.execute(&sql, params_from_iter(params))?;
    tracing::debug!(mm, old_uid, new_uid, changed, "remapped junction rows");
    Ok(changed)
  }
}

// ─── IndexStore ──────────────────────────────────────────────────────────────

impl IndexStore for SqliteStore {
  type Error = Error;

  fn index_rows(&self, filter: &IndexFilter) -> Result<Vec<ReferenceEntry>> {
    let mut conditions: Vec<&str> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    let text = |v: &String| SqlValue::Text(v.clone());
    let int = |v: &i64| SqlValue::Integer(*v);
    let constraints = [
      ("tablename = ?", filter.tablename.as_ref().map(text)),
      ("recuid = ?", filter.recuid.as_ref().map(int)),
      ("workspace = ?", filter.workspace.as_ref().map(int)),
      ("ref_table = ?", filter.ref_table.as_ref().map(text)),
      ("ref_uid = ?", filter.ref_uid.as_ref().map(int)),
      ("ref_string = ?", filter.ref_string.as_ref().map(text)),
    ];
    for (condition, value) in constraints {
      if let Some(value) = value {
        conditions.push(condition);
        params.push(value);
      }
    }

    let clause = if conditions.is_empty() {
      String::new()
    } else {
      format!("WHERE {}", conditions.join(" AND "))
    };
    let sql = format!(
      "SELECT {ENTRY_COLUMNS} FROM sys_refindex {clause} \
       ORDER BY tablename, recuid, field, flexpointer, sorting, hash"
    );
    let mut stmt = self.conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), decode_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
  }

  fn index_row(&self, hash: &str) -> Result<Option<ReferenceEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM sys_refindex WHERE hash = ?1");
    Ok(self.conn.query_row(&sql, params![hash], decode_entry).optional()?)
  }

  fn insert_index_row(&self, e: &ReferenceEntry) -> Result<()> {
    let sql = format!(
      "INSERT OR REPLACE INTO sys_refindex ({ENTRY_COLUMNS}) \
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    );
    self.conn.execute(&sql, params![
      e.hash,
      e.tablename,
      e.recuid,
      e.field,
      e.flexpointer,
      e.softref_key,
      e.softref_id,
      e.sorting,
      e.occurrence,
      e.deleted,
      e.workspace,
      e.ref_table,
      e.ref_uid,
      e.ref_string,
    ])?;
    Ok(())
  }

  fn set_index_sorting(&self, hash: &str, sorting: i64) -> Result<()> {
    self.conn.execute(
      "UPDATE sys_refindex SET sorting = ?2 WHERE hash = ?1",
      params![hash, sorting],
    )?;
    Ok(())
  }

  fn delete_index_rows(&self, hashes: &[String]) -> Result<usize> {
    let tx = self.conn.unchecked_transaction()?;
    let mut removed = 0;
    {
      let mut stmt = tx.prepare("DELETE FROM sys_refindex WHERE hash = ?1")?;
      for hash in hashes {
        removed += stmt.execute(params![hash])?;
      }
    }
    tx.commit()?;
    Ok(removed)
  }

  fn index_tables(&self) -> Result<Vec<String>> {
    self.query_column("SELECT DISTINCT tablename FROM sys_refindex ORDER BY tablename", Vec::new())
  }

  fn index_uids(&self, table: &str) -> Result<Vec<i64>> {
    self.query_column(
      "SELECT DISTINCT recuid FROM sys_refindex WHERE tablename = ? ORDER BY recuid",
      vec![SqlValue::Text(table.to_owned())],
    )
  }

  fn delete_index_rows_for_record(&self, table: &str, uid: i64) -> Result<usize> {
    Ok(self.conn.execute(
      "DELETE FROM sys_refindex WHERE tablename = ?1 AND recuid = ?2",
      params![table, uid],
    )?)
  }

  fn delete_index_rows_for_table(&self, table: &str) -> Result<usize> {
    Ok(self.conn.execute("DELETE FROM sys_refindex WHERE tablename = ?1", params![table])?)
  }

  fn registry_get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
    Ok(
      self
        .conn
        .query_row(
          "SELECT value FROM sys_registry WHERE namespace = ?1 AND key = ?2",
          params![namespace, key],
          |r| r.get(0),
        )
        .optional()?,
    )
  }

  fn registry_set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
    self.conn.execute(
      "INSERT INTO sys_registry (namespace, key, value) VALUES (?1, ?2, ?3)
       ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value",
      params![namespace, key, value],
    )?;
    Ok(())
  }
}
