mod commands;
mod logging;

use backstore::config::Config;
use backstore::{Backing, BackingOptions, Schema, SqliteMedium};
use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "backstore")]
#[command(about = "Identifier-mapped object cache over a SQLite backing store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/backstore/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// SQLite database to use
  #[arg(short, long)]
  database: Option<PathBuf>,

  /// Schema file describing the entities
  #[arg(short, long)]
  schema: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

// No async runtime here: the backing hands work to its context thread with
// blocking calls, which must not run on a runtime worker.
fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Command line overrides the config file
  let config = Config {
    database: args.database.or(config.database),
    schema: args.schema.or(config.schema),
    ..config
  };

  let _log_guard = logging::init(config.log_file.as_deref())?;

  let schema = Schema::load(config.schema_path()?)?;
  let medium = SqliteMedium::open(&config.database_path()?)?;
  tracing::debug!(database = %config.database_path()?.display(), "opened backing store");

  let backing = Backing::with_options(
    Arc::new(schema),
    Arc::new(medium),
    BackingOptions {
      identifier_key: config.resource_identifier_key.clone(),
      ..Default::default()
    },
  )?;

  let output = commands::execute(&backing, args.command)?;
  println!("{}", serde_json::to_string_pretty(&output)?);

  Ok(())
}
