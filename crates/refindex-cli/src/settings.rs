//! Runtime settings: a TOML file overlaid by `REFINDEX_*` environment
//! variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use refindex_core::Schema;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  /// SQLite database holding the content and the index.
  pub database:  PathBuf,
  /// TOML file describing tables and relation fields.
  pub schema:    PathBuf,
  /// Workspace the index is maintained for; 0 is live.
  #[serde(default)]
  pub workspace: i64,
}

impl Settings {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .set_default("database", "refindex.db")?
      .set_default("schema", "schema.toml")?
      .set_default("workspace", 0)?
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("REFINDEX"))
      .build()
      .context("failed to read settings")?;

    let mut settings: Self = settings
      .try_deserialize()
      .context("failed to deserialise settings")?;
    settings.database = expand_tilde(&settings.database);
    settings.schema = expand_tilde(&settings.schema);
    Ok(settings)
  }

  pub fn load_schema(&self) -> anyhow::Result<Schema> {
    let raw = std::fs::read_to_string(&self.schema)
      .with_context(|| format!("reading schema file {}", self.schema.display()))?;
    let schema: Schema = toml::from_str(&raw)
      .with_context(|| format!("parsing schema file {}", self.schema.display()))?;
    tracing::debug!(tables = schema.tables.len(), "loaded schema");
    Ok(schema)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn settings_fall_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load(&dir.path().join("missing.toml")).unwrap();
    assert_eq!(settings.workspace, 0);
    assert_eq!(settings.schema, PathBuf::from("schema.toml"));
  }

  #[test]
  fn settings_and_schema_load_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = dir.path().join("schema.toml");
    std::fs::write(
      &schema_path,
      r#"
[tables.page]
versioning = true

[tables.item.fields.refs]
type = "relation"
allowed = "page"

[tables.item.fields.image]
type = "file"
upload_folder = "uploads"
"#,
    )
    .unwrap();
    let settings_path = dir.path().join("refindex.toml");
    std::fs::write(
      &settings_path,
      format!("database = \"/tmp/x.db\"\nschema = {:?}\nworkspace = 2\n", schema_path),
    )
    .unwrap();

    let settings = Settings::load(&settings_path).unwrap();
    assert_eq!(settings.database, PathBuf::from("/tmp/x.db"));
    assert_eq!(settings.workspace, 2);

    let schema = settings.load_schema().unwrap();
    assert!(schema.table("page").unwrap().versioning);
    assert_eq!(schema.resolve_allowed("*"), ["item", "page"]);
  }
}
