use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backing::DEFAULT_IDENTIFIER_KEY;
use crate::medium::SqliteMedium;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// SQLite database path (defaults to the XDG data directory)
  pub database: Option<PathBuf>,
  /// Schema file describing the entities
  pub schema: Option<PathBuf>,
  /// Key under which predicates address the resource identifier
  #[serde(default = "default_identifier_key")]
  pub resource_identifier_key: String,
  /// Write logs here instead of stderr
  pub log_file: Option<PathBuf>,
}

fn default_identifier_key() -> String {
  DEFAULT_IDENTIFIER_KEY.to_string()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database: None,
      schema: None,
      resource_identifier_key: default_identifier_key(),
      log_file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./backstore.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/backstore/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(database) = std::env::var("BACKSTORE_DATABASE") {
      config.database = Some(PathBuf::from(database));
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("backstore.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("backstore").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Database path, falling back to the default location.
  pub fn database_path(&self) -> Result<PathBuf> {
    self
      .database
      .clone()
      .or_else(SqliteMedium::default_path)
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  /// Schema path; there is no default.
  pub fn schema_path(&self) -> Result<&Path> {
    self.schema.as_deref().ok_or_else(|| {
      eyre!(
        "No schema configured. Set `schema:` in ~/.config/backstore/config.yaml\n\
                 or pass --schema."
      )
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::from_yaml("schema: ./schema.yaml").unwrap();
    assert_eq!(config.resource_identifier_key, DEFAULT_IDENTIFIER_KEY);
    assert_eq!(config.schema_path().unwrap(), Path::new("./schema.yaml"));
    assert!(config.log_file.is_none());
  }

  #[test]
  fn test_explicit_fields() {
    let yaml = r#"
database: /tmp/store.db
resource_identifier_key: remoteID
log_file: /tmp/backstore.log
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/store.db"));
    assert_eq!(config.resource_identifier_key, "remoteID");
    assert!(config.schema_path().is_err());
  }

  #[test]
  fn test_missing_explicit_file() {
    let missing = Path::new("/nonexistent/backstore.yaml");
    assert!(Config::load(Some(missing)).is_err());
  }
}
