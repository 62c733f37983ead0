mod app;
mod backend;
mod cache;
mod commands;
mod config;
mod db;
mod event;
mod logging;
mod queue;
mod router;
mod server;
mod sync;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tillsync")]
#[command(about = "Offline-first local gateway for point-of-sale clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./tillsync.yaml, then $XDG_CONFIG_HOME/tillsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let log_dir = config.data_dir()?.join("logs");
  let filter = config.log_level.as_deref().unwrap_or("info");
  let _log_guard = logging::init(&log_dir, filter, args.command.logs_to_stderr())?;

  let app = app::App::new(config)?;
  commands::run(args.command, app).await
}
