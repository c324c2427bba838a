//! `refindex`: maintain and query the reference index of a content
//! repository stored in SQLite.
//!
//! # Usage
//!
//! ```text
//! refindex check
//! refindex update
//! refindex refs-to page 5
//! refindex rewrite 3f2a… --value page:7 --apply
//! refindex --config ~/.config/refindex.toml lost --json
//! ```

mod settings;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use refindex_core::{
  ReferenceIndex, Schema,
  entry::ReferenceEntry,
  extract::{Extractor, Relations},
  record::Record,
  schema::FieldConfig,
  softref::SoftRefRegistry,
  store::RecordStore,
};
use refindex_store_sqlite::SqliteStore;
use serde::Serialize;
use settings::Settings;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "refindex", version, about = "Reference index maintenance")]
struct Args {
  /// Path to the TOML settings file (database, schema, workspace).
  #[arg(short, long, value_name = "FILE", default_value = "refindex.toml")]
  config: PathBuf,

  /// Print results as JSON.
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Report what a full reconciliation would change.
  Check,
  /// Reconcile the whole index.
  Update,
  /// Bring the rows of one record up to date.
  Record {
    table:   String,
    uid:     i64,
    #[arg(long)]
    dry_run: bool,
  },
  /// List references pointing at a record.
  RefsTo { table: String, uid: i64 },
  /// List references pointing at a file path.
  RefsToFile { path: String },
  /// List references whose target record does not exist.
  Lost,
  /// Show what one field of a record points at.
  Resolve {
    table: String,
    uid:   i64,
    field: String,
    /// Drop uids not visible in the configured workspace.
    #[arg(long)]
    purge: bool,
  },
  /// Replace or remove the reference recorded under an index hash.
  Rewrite {
    hash:  String,
    /// Replacement (`table:uid`, a file path or literal text). Omit to
    /// remove the reference.
    #[arg(long)]
    value: Option<String>,
    /// Write the change; otherwise only show it.
    #[arg(long)]
    apply: bool,
  },
  /// When the index was last reconciled.
  LastRun,
}

// ─── Entry point ──────────────────────────────────────────────────────────────

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let args = Args::parse();
  let settings = Settings::load(&args.config)?;
  let schema = settings.load_schema()?;

  let store = SqliteStore::open(&settings.database)
    .with_context(|| format!("failed to open store at {:?}", settings.database))?;
  store
    .ensure_schema(&schema)
    .context("failed to prepare content tables")?;

  let registry = SoftRefRegistry::with_defaults();
  let index = ReferenceIndex::new(&store, &schema, &registry).with_workspace(settings.workspace);
  let out = Output { json: args.json };

  match args.command {
    Command::Check => reconcile(&index, true, out)?,
    Command::Update => reconcile(&index, false, out)?,
    Command::Record { table, uid, dry_run } => {
      let result = index.update_ref_index_table(&table, uid, dry_run)?;
      let entries: Vec<_> = result.entries.iter().map(|(action, e)| (action, e)).collect();
      out.show(&entries, || {
        for (action, entry) in &result.entries {
          println!("{action:>7}  {}", describe(entry));
        }
        println!("{} kept, {} added, {} deleted", result.kept, result.added, result.deleted);
      })?;
    }
    Command::RefsTo { table, uid } => {
      let entries = index.references_to(&table, uid)?;
      out.entries(&entries)?;
    }
    Command::RefsToFile { path } => {
      let entries = index.references_to_file(&path)?;
      out.entries(&entries)?;
    }
    Command::Lost => {
      let entries = index.lost_references()?;
      out.entries(&entries)?;
    }
    Command::Resolve { table, uid, field, purge } => {
      let record = store
        .get_record(&table, uid)?
        .with_context(|| format!("record {table}:{uid} does not exist"))?;
      let extractor = Extractor::new(&store, &schema, &registry).with_workspace(settings.workspace);
      resolve(&extractor, &schema, &record, &field, purge.then_some(settings.workspace), out)?;
    }
    Command::Rewrite { hash, value, apply } => {
      let write_back = match index.set_reference_value(&hash, value.as_deref())? {
        Ok(write_back) => write_back,
        Err(refusal) => bail!("refused: {refusal}"),
      };
      out.show(&write_back, || {
        println!("{}:{} {} = {}", write_back.table, write_back.uid, write_back.field, write_back.value);
      })?;
      if apply {
        let result = index.apply_write_back(&write_back)?;
        tracing::info!(
          added = result.added,
          deleted = result.deleted,
          "rewrite applied"
        );
      }
    }
    Command::LastRun => {
      let last = index.last_run()?;
      out.show(&last, || match last {
        Some(at) => println!("{}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("never"),
      })?;
    }
  }

  Ok(())
}

fn reconcile(index: &ReferenceIndex<'_, SqliteStore>, dry_run: bool, out: Output) -> Result<()> {
  let report = index.update_index(dry_run).context("reconciliation failed")?;
  out.show(&report, || print!("{report}"))
}

/// Print the targets of one field. Relations can be purged for a workspace.
fn resolve(
  extractor: &Extractor<'_, SqliteStore>,
  schema: &Schema,
  record: &Record,
  field: &str,
  purge: Option<i64>,
  out: Output,
) -> Result<()> {
  let Some(config) = schema.field(&record.table, field) else {
    bail!("{}.{field} is not configured", record.table);
  };

  if let FieldConfig::Relation(rc) = config {
    let mut handler = extractor.relation_handler(record, &record.text(field), rc, true)?;
    if let Some(workspace) = purge {
      handler.purge_item_array(workspace)?;
    }
    let items = handler.item_array();
    return out.show(&items, || {
      for item in items {
        println!("{}:{}", item.table, item.uid);
      }
      if !handler.is_mm() && rc.foreign_field.is_none() {
        println!("value: {}", handler.csv_value());
      }
    });
  }

  let groups = extractor.field(record, field)?;
  let targets: Vec<(String, String)> = groups
    .iter()
    .flat_map(|g| {
      let at = if g.path.is_empty() { g.field.clone() } else { format!("{}:{}", g.field, g.path) };
      let targets: Vec<String> = match &g.relations {
        Relations::Db(items) => items.iter().map(|i| format!("{}:{}", i.table, i.uid)).collect(),
        Relations::Files(paths) => paths.clone(),
        Relations::SoftRefs(results) => results
          .iter()
          .flat_map(|(key, r)| r.elements.iter().map(move |e| format!("{key} {}", e.matched)))
          .collect(),
      };
      targets.into_iter().map(move |t| (at.clone(), t))
    })
    .collect();
  out.show(&targets, || {
    for (at, target) in &targets {
      println!("{at}  {target}");
    }
  })
}

// ─── Output ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Output {
  json: bool,
}

impl Output {
  fn show<T: Serialize + ?Sized>(self, value: &T, text: impl FnOnce()) -> Result<()> {
    if self.json {
      println!("{}", serde_json::to_string_pretty(value)?);
    } else {
      text();
    }
    Ok(())
  }

  fn entries(self, entries: &[ReferenceEntry]) -> Result<()> {
    self.show(entries, || {
      for entry in entries {
        println!("{}", describe(entry));
      }
      if entries.is_empty() {
        println!("no references");
      }
    })
  }
}

/// One line per index row: source location, target, hash.
fn describe(e: &ReferenceEntry) -> String {
  let mut at = format!("{}:{} {}", e.tablename, e.recuid, e.field);
  if !e.flexpointer.is_empty() {
    at.push(':');
    at.push_str(&e.flexpointer);
  }
  if e.is_soft_reference() {
    at.push_str(&format!(" [{}]", e.softref_key));
  }
  let target = if e.ref_string.is_empty() {
    format!("{}:{}", e.ref_table, e.ref_uid)
  } else {
    format!("{} {}", e.ref_table, e.ref_string)
  };
  let deleted = if e.deleted { " (deleted)" } else { "" };
  format!("{at} -> {target}{deleted}  {}", e.hash)
}
