//! SQL schema for the index tables.
//!
//! Content and junction tables are not part of it: they belong to the
//! repository and are created from the schema registry by
//! [`SqliteStore::ensure_schema`](crate::SqliteStore::ensure_schema).

/// Index and registry DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- One row per reference occurrence. A changed occurrence is a new hash;
-- only `sorting` is updated in place.
CREATE TABLE IF NOT EXISTS sys_refindex (
    hash        TEXT PRIMARY KEY,   -- sha-256 hex over the occurrence columns
    tablename   TEXT NOT NULL,
    recuid      INTEGER NOT NULL,
    field       TEXT NOT NULL,
    flexpointer TEXT NOT NULL DEFAULT '',
    softref_key TEXT NOT NULL DEFAULT '',
    softref_id  TEXT NOT NULL DEFAULT '',
    sorting     INTEGER NOT NULL DEFAULT 0,
    occurrence  INTEGER NOT NULL DEFAULT 0,
    deleted     INTEGER NOT NULL DEFAULT 0,
    workspace   INTEGER NOT NULL DEFAULT 0,
    ref_table   TEXT NOT NULL,      -- '_FILE' | '_STRING' | a table name
    ref_uid     INTEGER NOT NULL DEFAULT 0,
    ref_string  TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS refindex_source_idx ON sys_refindex(tablename, recuid, workspace);
CREATE INDEX IF NOT EXISTS refindex_target_idx ON sys_refindex(ref_table, ref_uid);
CREATE INDEX IF NOT EXISTS refindex_string_idx ON sys_refindex(ref_table, ref_string);

CREATE TABLE IF NOT EXISTS sys_registry (
    namespace TEXT NOT NULL,
    key       TEXT NOT NULL,
    value     TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);

PRAGMA user_version = 2;
";

/// Columns every junction table carries.
pub const JUNCTION_COLUMNS: &str = "
    uid_local       INTEGER NOT NULL DEFAULT 0,
    uid_foreign     INTEGER NOT NULL DEFAULT 0,
    tablenames      TEXT NOT NULL DEFAULT '',
    sorting         INTEGER NOT NULL DEFAULT 0,
    sorting_foreign INTEGER NOT NULL DEFAULT 0
";
